//! Stripe webhook handling
//!
//! Verifies signed event envelopes, claims each event exactly once, and
//! routes it through classification into the transition engine.
//!
//! Signature verification is done manually (HMAC-SHA256 over
//! `timestamp.payload` against the v1 signature): newer Stripe API versions
//! add payload fields that async-stripe's pinned types reject, so the
//! payload is verified raw and parsed into a minimal envelope with
//! serde_json.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cancellation::{StripeGateway, SubscriptionGateway};
use crate::classifier::{classify, EventClass, SubscriptionFacts, WebhookEnvelope};
use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;
use crate::resolver::UserResolver;
use crate::transition::{EventContext, TransitionEngine};

type HmacSha256 = Hmac<Sha256>;

/// Events stuck in `processing` longer than this can be re-claimed; covers
/// workers that died mid-event.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Webhook handler for Stripe events
pub struct WebhookHandler<G = StripeGateway> {
    webhook_secret: String,
    pool: PgPool,
    resolver: UserResolver,
    engine: TransitionEngine,
    catalog: PlanCatalog,
    gateway: G,
}

impl<G: SubscriptionGateway> WebhookHandler<G> {
    pub fn new(
        webhook_secret: String,
        pool: PgPool,
        resolver: UserResolver,
        engine: TransitionEngine,
        catalog: PlanCatalog,
        gateway: G,
    ) -> Self {
        Self {
            webhook_secret,
            pool,
            resolver,
            engine,
            catalog,
            gateway,
        }
    }

    /// Verify a signed payload and parse the envelope.
    ///
    /// The signature header has the form `t=timestamp,v1=signature[,v0=...]`.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEnvelope> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        // Reject replays older than 5 minutes
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > 300 {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let envelope: WebhookEnvelope = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(envelope)
    }

    /// Handle a verified event.
    ///
    /// Uses INSERT...ON CONFLICT...RETURNING to atomically claim exclusive
    /// processing rights, so two concurrent deliveries of the same event
    /// cannot both run. Events stuck in `processing` past the timeout are
    /// re-claimable.
    pub async fn handle_event(&self, envelope: WebhookEnvelope) -> BillingResult<()> {
        let event_id = envelope.id.clone();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(envelope.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&envelope.event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %envelope.event_type,
                "Duplicate webhook event - already claimed or processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %envelope.event_type,
            "Processing webhook event"
        );

        let result = self.process_event_internal(&envelope).await;

        let (processing_result, error_message, ack) = match &result {
            Ok(()) => ("success", None, Ok(())),
            // Unmatched users are terminal for the event: record for manual
            // reconciliation and acknowledge so the provider stops retrying.
            Err(BillingError::UserResolution { .. }) => (
                "unmatched",
                result.as_ref().err().map(|e| e.to_string()),
                Ok(()),
            ),
            Err(e) => ("error", Some(e.to_string()), Err(())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to update webhook audit record; event may appear stuck in processing"
            );
        }

        match ack {
            Ok(()) => Ok(()),
            Err(()) => result,
        }
    }

    async fn process_event_internal(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        match classify(envelope) {
            EventClass::NewSubscription(facts) => {
                self.handle_new_subscription(envelope, facts).await
            }
            EventClass::PlanChange(facts) => self.handle_plan_change(envelope, facts).await,
            EventClass::Renewal(facts) => self.handle_renewal(envelope, facts).await,
            EventClass::Cancellation(facts) => self.handle_cancellation(envelope, facts).await,
            EventClass::Ignored => {
                tracing::info!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Event type not handled - acknowledged"
                );
                Ok(())
            }
        }
    }

    async fn handle_new_subscription(
        &self,
        envelope: &WebhookEnvelope,
        mut facts: SubscriptionFacts,
    ) -> BillingResult<()> {
        // Checkout sessions do not carry a price; backfill from the
        // subscription object. Provider failure here is non-fatal because
        // the redundant customer.subscription.created event carries the
        // price itself.
        if facts.price_id.is_none() {
            if let Some(subscription_id) = &facts.subscription_id {
                match self.gateway.subscription_snapshot(subscription_id).await {
                    Ok(snapshot) => {
                        facts.price_id = snapshot.price_id;
                        if facts.customer_id.is_none() {
                            facts.customer_id = snapshot.customer_id;
                        }
                        facts.current_period_end = snapshot.current_period_end;
                    }
                    Err(e) => {
                        tracing::warn!(
                            event_id = %envelope.id,
                            subscription_id = %subscription_id,
                            error = %e,
                            "Could not fetch subscription detail - deferring to the subscription event"
                        );
                    }
                }
            }
        }

        let Some(price_id) = &facts.price_id else {
            tracing::warn!(
                event_id = %envelope.id,
                "New subscription event without a resolvable price - skipped"
            );
            return Ok(());
        };

        let plan = self.catalog.resolve(price_id).plan();
        let resolved = self
            .resolver
            .resolve(
                facts.customer_id.as_deref(),
                facts.email.as_deref(),
                Some(&envelope.id),
            )
            .await?;

        if let Some(customer_id) = &facts.customer_id {
            self.resolver
                .link_customer(resolved.user_id, customer_id)
                .await?;
        }

        self.engine
            .activate(
                resolved.user_id,
                plan,
                facts.email.as_deref(),
                facts.subscription_id.as_deref(),
                facts.customer_id.as_deref(),
                &self.ctx(envelope, &facts),
            )
            .await?;

        Ok(())
    }

    async fn handle_plan_change(
        &self,
        envelope: &WebhookEnvelope,
        facts: SubscriptionFacts,
    ) -> BillingResult<()> {
        let Some(price_id) = &facts.price_id else {
            tracing::warn!(
                event_id = %envelope.id,
                "Plan change event without a price - skipped"
            );
            return Ok(());
        };

        let plan = self.catalog.resolve(price_id).plan();
        let resolved = self
            .resolver
            .resolve(
                facts.customer_id.as_deref(),
                facts.email.as_deref(),
                Some(&envelope.id),
            )
            .await?;

        self.engine
            .change_plan(resolved.user_id, plan, &self.ctx(envelope, &facts))
            .await?;

        Ok(())
    }

    async fn handle_renewal(
        &self,
        envelope: &WebhookEnvelope,
        facts: SubscriptionFacts,
    ) -> BillingResult<()> {
        let event_plan = facts
            .price_id
            .as_deref()
            .map(|price_id| self.catalog.resolve(price_id).plan());

        let resolved = self
            .resolver
            .resolve(
                facts.customer_id.as_deref(),
                facts.email.as_deref(),
                Some(&envelope.id),
            )
            .await?;

        self.engine
            .renew(resolved.user_id, event_plan, &self.ctx(envelope, &facts))
            .await?;

        Ok(())
    }

    async fn handle_cancellation(
        &self,
        envelope: &WebhookEnvelope,
        facts: SubscriptionFacts,
    ) -> BillingResult<()> {
        let resolved = self
            .resolver
            .resolve(
                facts.customer_id.as_deref(),
                facts.email.as_deref(),
                Some(&envelope.id),
            )
            .await?;

        self.engine
            .cancel(
                resolved.user_id,
                facts.current_period_end,
                &self.ctx(envelope, &facts),
            )
            .await?;

        Ok(())
    }

    fn ctx(&self, envelope: &WebhookEnvelope, facts: &SubscriptionFacts) -> EventContext {
        let mut ctx = EventContext::stripe(&envelope.id);
        if let Some(subscription_id) = &facts.subscription_id {
            ctx = ctx.subscription(subscription_id.clone());
        }
        if let Some(customer_id) = &facts.customer_id {
            ctx = ctx.customer(customer_id.clone());
        }
        ctx
    }

    /// Recent events that did not process cleanly, for the admin surface
    pub async fn recent_failures(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp,
                   processing_result, error_message, created_at
            FROM stripe_webhook_events
            WHERE processing_result IN ('error', 'unmatched')
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Drop processed webhook rows older than the retention window
    pub async fn cleanup_old_events(&self, retention_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE created_at < NOW() - ($1 || ' days')::INTERVAL
              AND processing_result IN ('success', 'error', 'unmatched')
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Row shape for the webhook audit table
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}
