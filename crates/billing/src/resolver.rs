//! User resolution
//!
//! Billing events identify a user by Stripe customer id and/or email, never
//! by internal user id. Resolution tries, in order: email against the
//! primary entitlement store, email against the legacy profiles table, then
//! the stored customer-id mapping. A miss on all three is terminal for the
//! event and is logged with full context for manual reconciliation.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::EntitlementStore;

/// Which lookup strategy matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    PrimaryEmail,
    LegacyProfileEmail,
    CustomerMapping,
}

/// A resolved internal identity
#[derive(Debug, Clone, Copy)]
pub struct ResolvedUser {
    pub user_id: Uuid,
    pub via: ResolutionPath,
}

/// Resolves billing-event identities to internal user ids
#[derive(Clone)]
pub struct UserResolver {
    pool: PgPool,
    store: EntitlementStore,
}

impl UserResolver {
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: EntitlementStore::new(pool.clone()),
            pool,
        }
    }

    /// Resolve an internal user id from event identifiers.
    ///
    /// `event_id` is carried only for log context.
    pub async fn resolve(
        &self,
        customer_id: Option<&str>,
        email: Option<&str>,
        event_id: Option<&str>,
    ) -> BillingResult<ResolvedUser> {
        if let Some(email) = email {
            if let Some(ent) = self.store.get_by_email(email).await? {
                return Ok(ResolvedUser {
                    user_id: ent.user_id,
                    via: ResolutionPath::PrimaryEmail,
                });
            }

            if let Some(user_id) = self.store.secondary_user_by_email(email).await? {
                tracing::info!(
                    user_id = %user_id,
                    "User resolved via legacy profiles table - primary record missing or unkeyed by email"
                );
                return Ok(ResolvedUser {
                    user_id,
                    via: ResolutionPath::LegacyProfileEmail,
                });
            }
        }

        if let Some(customer_id) = customer_id {
            let row: Option<(Uuid,)> = sqlx::query_as(
                "SELECT user_id FROM stripe_customers WHERE stripe_customer_id = $1",
            )
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((user_id,)) = row {
                return Ok(ResolvedUser {
                    user_id,
                    via: ResolutionPath::CustomerMapping,
                });
            }
        }

        tracing::error!(
            customer_id = ?customer_id,
            email = ?email,
            event_id = ?event_id,
            "User resolution failed - event needs manual reconciliation"
        );

        Err(BillingError::UserResolution {
            customer_id: customer_id.map(str::to_string),
            email: email.map(str::to_string),
            event_id: event_id.map(str::to_string),
        })
    }

    /// Record a customer-id -> user-id mapping, first write wins
    pub async fn link_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_customers (user_id, stripe_customer_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
