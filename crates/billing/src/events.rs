//! Entitlement audit events
//!
//! Append-only log of entitlement mutations. Events answer "why is this user
//! on this plan with this limit?" questions, reconstruct billing history for
//! support tickets, and give the drift repair job an audit trail.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of entitlement events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementEventType {
    SubscriptionActivated,
    PlanChanged,
    DowngradeDeferred,
    SubscriptionRenewed,
    SubscriptionCanceled,
    SubscriptionExpired,
    AdminAdjusted,
    DriftRepaired,
    CustomerLinked,
}

impl std::fmt::Display for EntitlementEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntitlementEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            EntitlementEventType::PlanChanged => "PLAN_CHANGED",
            EntitlementEventType::DowngradeDeferred => "DOWNGRADE_DEFERRED",
            EntitlementEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            EntitlementEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            EntitlementEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            EntitlementEventType::AdminAdjusted => "ADMIN_ADJUSTED",
            EntitlementEventType::DriftRepaired => "DRIFT_REPAIRED",
            EntitlementEventType::CustomerLinked => "CUSTOMER_LINKED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through UI
    User,
    /// Admin user
    Admin,
    /// System automation (sync job, expiry sweep)
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// An entitlement event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EntitlementEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating entitlement events
pub struct EntitlementEventBuilder {
    user_id: Uuid,
    event_type: EntitlementEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    actor_type: ActorType,
}

impl EntitlementEventBuilder {
    pub fn new(user_id: Uuid, event_type: EntitlementEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn stripe_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.stripe_customer_id = Some(customer_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging and querying entitlement events
#[derive(Clone)]
pub struct EntitlementEventLogger {
    pool: PgPool,
}

impl EntitlementEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log an entitlement event
    pub async fn log_event(&self, builder: EntitlementEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO entitlement_events (
                user_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                stripe_customer_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_subscription_id)
        .bind(&builder.stripe_customer_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Recent events for a user, newest first
    pub async fn recent_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<EntitlementEvent>> {
        let events: Vec<EntitlementEvent> = sqlx::query_as(
            r#"
            SELECT
                id,
                user_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                stripe_customer_id,
                actor_type,
                created_at
            FROM entitlement_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
