//! Stripe client configuration

use std::time::Duration;

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each plan
    pub price_ids: PriceIds,
    /// Upper bound on any single outbound Stripe call
    pub provider_timeout: Duration,
}

/// Stripe price IDs for subscription plans
/// Plan hierarchy: Free (no price) → Standard ($29, 50 photos) → Agency ($99, 300 photos)
#[derive(Debug, Clone)]
pub struct PriceIds {
    // Monthly plans
    pub standard: String,
    pub agency: String,

    // Annual plans (20% discount)
    pub standard_annual: Option<String>,
    pub agency_annual: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                standard: std::env::var("STRIPE_PRICE_STANDARD").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_STANDARD not set".to_string())
                })?,
                agency: std::env::var("STRIPE_PRICE_AGENCY")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_AGENCY not set".to_string()))?,
                standard_annual: std::env::var("STRIPE_PRICE_STANDARD_ANNUAL").ok(),
                agency_annual: std::env::var("STRIPE_PRICE_AGENCY_ANNUAL").ok(),
            },
            provider_timeout: Duration::from_secs(
                std::env::var("STRIPE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
