//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("No internal user matched (customer: {customer_id:?}, email: {email:?}, event: {event_id:?})")]
    UserResolution {
        customer_id: Option<String>,
        email: Option<String>,
        event_id: Option<String>,
    },

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
