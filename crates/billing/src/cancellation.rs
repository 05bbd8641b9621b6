//! User-initiated cancellation
//!
//! The webhook path reacts to provider state; this path drives it. The
//! contract is asymmetric by design: cancellation must always succeed from
//! the user's point of view, even when Stripe is down or the subscription
//! cannot be located, so every provider interaction here degrades to None
//! and the local transition runs regardless. The synchronizer and the
//! eventual `customer.subscription.deleted` webhook square up whatever the
//! provider side actually did.
//!
//! Provider access sits behind a trait so the workflow can be exercised
//! against a failing provider.

use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use stageright_shared::{Entitlement, PlanType};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::transition::{EventContext, TransitionEngine};

/// Result of asking the provider to cancel a subscription
#[derive(Debug, Clone)]
pub struct ProviderCancellation {
    pub subscription_id: String,
    pub period_end: Option<OffsetDateTime>,
}

/// Provider-side view of a subscription
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
}

/// Outbound billing-provider operations used by the engine
pub trait SubscriptionGateway: Send + Sync {
    /// Schedule a cancellation at period end, returning the effective end
    fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> impl std::future::Future<Output = BillingResult<ProviderCancellation>> + Send;

    /// Find the customer's active subscription id, if any
    fn active_subscription_for_customer(
        &self,
        customer_id: &str,
    ) -> impl std::future::Future<Output = BillingResult<Option<String>>> + Send;

    /// Find a customer id by email
    fn find_customer_by_email(
        &self,
        email: &str,
    ) -> impl std::future::Future<Output = BillingResult<Option<String>>> + Send;

    /// Fetch the provider's view of a subscription
    fn subscription_snapshot(
        &self,
        subscription_id: &str,
    ) -> impl std::future::Future<Output = BillingResult<ProviderSubscription>> + Send;
}

/// Stripe-backed gateway with bounded per-call timeouts
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
    timeout: Duration,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        let timeout = stripe.config().provider_timeout;
        Self { stripe, timeout }
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        fut: impl std::future::Future<Output = Result<T, stripe::StripeError>>,
    ) -> BillingResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => Err(BillingError::StripeApi(format!("{what} timed out"))),
        }
    }
}

fn period_end_of(subscription: &stripe::Subscription) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok()
}

impl SubscriptionGateway for StripeGateway {
    async fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderCancellation> {
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        // Cancel at period end rather than immediately: the user keeps what
        // they paid for until the cycle closes.
        let params = stripe::UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        let subscription = self
            .bounded(
                "subscription cancel",
                stripe::Subscription::update(self.stripe.inner(), &sub_id, params),
            )
            .await?;

        Ok(ProviderCancellation {
            subscription_id: subscription.id.to_string(),
            period_end: period_end_of(&subscription),
        })
    }

    async fn active_subscription_for_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<String>> {
        let customer_id = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let params = stripe::ListSubscriptions {
            customer: Some(customer_id),
            ..Default::default()
        };

        let subscriptions = self
            .bounded(
                "subscription list",
                stripe::Subscription::list(self.stripe.inner(), &params),
            )
            .await?;

        Ok(subscriptions
            .data
            .into_iter()
            .find(|s| {
                matches!(
                    s.status,
                    stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing
                )
            })
            .map(|s| s.id.to_string()))
    }

    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        let params = stripe::ListCustomers {
            email: Some(email),
            ..Default::default()
        };

        let customers = self
            .bounded(
                "customer search",
                stripe::Customer::list(self.stripe.inner(), &params),
            )
            .await?;

        Ok(customers.data.first().map(|c| c.id.to_string()))
    }

    async fn subscription_snapshot(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let subscription = self
            .bounded(
                "subscription retrieve",
                stripe::Subscription::retrieve(self.stripe.inner(), &sub_id, &[]),
            )
            .await?;

        Ok(ProviderSubscription {
            subscription_id: subscription.id.to_string(),
            customer_id: Some(subscription.customer.id().to_string()),
            price_id: subscription
                .items
                .data
                .first()
                .and_then(|item| item.price.as_ref())
                .map(|p| p.id.to_string()),
            status: subscription.status.to_string(),
            current_period_start: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_start,
            )
            .ok(),
            current_period_end: period_end_of(&subscription),
        })
    }
}

/// Response of the cancellation workflow. `success` is true for every valid
/// request; provider-side failure shows up only as a missing end date.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancellationOutcome {
    pub success: bool,
    pub message: String,
    pub subscription_end_date: Option<OffsetDateTime>,
    pub plan_type: PlanType,
    pub photos_limit: i32,
}

pub fn cancellation_message(end_date: Option<OffsetDateTime>) -> String {
    match end_date {
        Some(end) => format!(
            "Subscription canceled. Your plan stays active until {}.",
            end.date()
        ),
        None => "Subscription canceled.".to_string(),
    }
}

/// Orchestrates user-initiated cancellation
#[derive(Clone)]
pub struct CancellationService<G> {
    gateway: G,
    engine: TransitionEngine,
}

impl<G: SubscriptionGateway> CancellationService<G> {
    pub fn new(gateway: G, engine: TransitionEngine) -> Self {
        Self { gateway, engine }
    }

    /// Cancel a user's subscription.
    ///
    /// Errors only on invalid input or a primary-store failure; every
    /// provider-side problem is logged and absorbed.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        subscription_id: Option<String>,
    ) -> BillingResult<CancellationOutcome> {
        if user_id.is_nil() {
            return Err(BillingError::InvalidInput("user_id is required".to_string()));
        }

        let current = self.engine.store().get(user_id).await?;

        let located = locate_subscription(&self.gateway, subscription_id, current.as_ref()).await;

        let provider = match &located {
            Some(sub_id) => cancel_at_provider(&self.gateway, sub_id).await,
            None => {
                tracing::warn!(
                    user_id = %user_id,
                    "No billing subscription located - canceling locally only"
                );
                None
            }
        };

        let mut ctx = EventContext::user();
        if let Some(sub_id) = &located {
            ctx = ctx.subscription(sub_id.clone());
        }

        let entitlement = self
            .engine
            .cancel(user_id, provider.as_ref().and_then(|p| p.period_end), &ctx)
            .await?;

        Ok(CancellationOutcome {
            success: true,
            message: cancellation_message(entitlement.subscription_end_date),
            subscription_end_date: entitlement.subscription_end_date,
            plan_type: entitlement.plan_type,
            photos_limit: entitlement.photos_limit,
        })
    }

}

/// Resolve the subscription id to cancel: explicit, stored, by customer id,
/// then by email search. Never errors; a miss just means a local-only
/// cancellation.
async fn locate_subscription<G: SubscriptionGateway>(
    gateway: &G,
    explicit: Option<String>,
    current: Option<&Entitlement>,
) -> Option<String> {
    if let Some(id) = explicit {
        return Some(id);
    }

    let current = current?;

    if let Some(id) = &current.stripe_subscription_id {
        return Some(id.clone());
    }

    let customer_id = match &current.stripe_customer_id {
        Some(id) => Some(id.clone()),
        None => match &current.email {
            Some(email) => match gateway.find_customer_by_email(email).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        user_id = %current.user_id,
                        error = %e,
                        "Customer search failed during cancellation"
                    );
                    None
                }
            },
            None => None,
        },
    };

    match customer_id {
        Some(customer_id) => match gateway.active_subscription_for_customer(&customer_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    user_id = %current.user_id,
                    customer_id = %customer_id,
                    error = %e,
                    "Subscription lookup failed during cancellation"
                );
                None
            }
        },
        None => None,
    }
}

/// Ask the provider to cancel; degrade to None on any failure
async fn cancel_at_provider<G: SubscriptionGateway>(
    gateway: &G,
    subscription_id: &str,
) -> Option<ProviderCancellation> {
    match gateway.cancel_at_period_end(subscription_id).await {
        Ok(cancellation) => Some(cancellation),
        Err(e) => {
            tracing::warn!(
                subscription_id = %subscription_id,
                error = %e,
                "Provider cancel failed - proceeding with local cancellation"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gateway that fails every call, simulating a provider outage
    struct DownGateway;

    impl SubscriptionGateway for DownGateway {
        async fn cancel_at_period_end(
            &self,
            _subscription_id: &str,
        ) -> BillingResult<ProviderCancellation> {
            Err(BillingError::StripeApi("subscription cancel timed out".into()))
        }

        async fn active_subscription_for_customer(
            &self,
            _customer_id: &str,
        ) -> BillingResult<Option<String>> {
            Err(BillingError::StripeApi("subscription list timed out".into()))
        }

        async fn find_customer_by_email(&self, _email: &str) -> BillingResult<Option<String>> {
            Err(BillingError::StripeApi("customer search timed out".into()))
        }

        async fn subscription_snapshot(
            &self,
            _subscription_id: &str,
        ) -> BillingResult<ProviderSubscription> {
            Err(BillingError::StripeApi("subscription retrieve timed out".into()))
        }
    }

    fn entitlement_with(
        email: Option<&str>,
        customer: Option<&str>,
        subscription: Option<&str>,
    ) -> Entitlement {
        let now = OffsetDateTime::now_utc();
        let mut ent =
            Entitlement::free_defaults(Uuid::new_v4(), email.map(str::to_string), now);
        ent.stripe_customer_id = customer.map(str::to_string);
        ent.stripe_subscription_id = subscription.map(str::to_string);
        ent
    }

    #[tokio::test]
    async fn test_explicit_subscription_id_wins() {
        let found = locate_subscription(
            &DownGateway,
            Some("sub_explicit".to_string()),
            Some(&entitlement_with(None, None, Some("sub_stored"))),
        )
        .await;
        assert_eq!(found.as_deref(), Some("sub_explicit"));
    }

    #[tokio::test]
    async fn test_stored_subscription_id_used_without_provider_call() {
        let found = locate_subscription(
            &DownGateway,
            None,
            Some(&entitlement_with(None, None, Some("sub_stored"))),
        )
        .await;
        assert_eq!(found.as_deref(), Some("sub_stored"));
    }

    #[tokio::test]
    async fn test_provider_outage_degrades_to_local_cancellation() {
        // Lookup by customer id and by email both fail; the workflow must
        // come back with None instead of an error.
        let by_customer = locate_subscription(
            &DownGateway,
            None,
            Some(&entitlement_with(None, Some("cus_1"), None)),
        )
        .await;
        assert!(by_customer.is_none());

        let by_email = locate_subscription(
            &DownGateway,
            None,
            Some(&entitlement_with(Some("a@b.com"), None, None)),
        )
        .await;
        assert!(by_email.is_none());

        let canceled = cancel_at_provider(&DownGateway, "sub_1").await;
        assert!(canceled.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user_snapshot_cancels_locally() {
        let found = locate_subscription(&DownGateway, None, None).await;
        assert!(found.is_none());
    }

    #[test]
    fn test_cancellation_message() {
        assert_eq!(cancellation_message(None), "Subscription canceled.");

        let end = OffsetDateTime::from_unix_timestamp(1_702_592_000).unwrap();
        let msg = cancellation_message(Some(end));
        assert!(msg.contains("stays active until"));
    }
}
