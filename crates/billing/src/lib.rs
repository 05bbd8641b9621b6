// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some transition paths carry many identifiers
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! StageRight Billing Module
//!
//! Keeps a user's photo credits consistent with their Stripe subscription
//! state across asynchronous, possibly duplicated, out-of-order billing
//! events, user-initiated cancellations, and admin overrides - while the
//! authoritative entitlement table and its legacy mirror must never
//! permanently disagree.
//!
//! ## Pieces
//!
//! - **Plan catalog**: price id -> plan tier + photo allotment, with a
//!   heuristic fallback for catalog drift
//! - **User resolver**: billing identities -> internal user id
//! - **Store adapter**: one write path over both entitlement tables
//! - **Classifier**: Stripe event -> semantic category
//! - **Transition engine**: the state machine; the only entitlement writer
//! - **Credit synchronizer**: drift detection and primary-wins repair
//! - **Cancellation workflow**: always-succeeds user cancellation
//! - **Webhooks**: signature verification and idempotent event intake

pub mod cancellation;
pub mod classifier;
pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod plans;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod transition;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Cancellation
pub use cancellation::{
    CancellationOutcome, CancellationService, ProviderCancellation, ProviderSubscription,
    StripeGateway, SubscriptionGateway,
};

// Classifier
pub use classifier::{classify, EventClass, SubscriptionFacts, WebhookData, WebhookEnvelope};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, EntitlementEvent, EntitlementEventBuilder, EntitlementEventLogger,
    EntitlementEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Plans
pub use plans::{Plan, PlanCatalog, PlanResolution};

// Resolver
pub use resolver::{ResolutionPath, ResolvedUser, UserResolver};

// Store
pub use store::{ConsumeOutcome, EntitlementStore, EntitlementUpdate, ProfileRow};

// Sync
pub use sync::{CreditSynchronizer, RepairAction, SyncOutcome, SyncReport};

// Transition
pub use transition::{
    EventContext, LimitChange, PlanChangeOutcome, SubscriptionPhase, TransitionEngine,
};

// Webhooks
pub use webhooks::{WebhookEventRecord, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all entitlement functionality
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub store: EntitlementStore,
    pub resolver: UserResolver,
    pub events: EntitlementEventLogger,
    pub engine: TransitionEngine,
    pub sync: CreditSynchronizer,
    pub cancellation: CancellationService<StripeGateway>,
    pub webhooks: WebhookHandler<StripeGateway>,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config.clone());
        let catalog = PlanCatalog::new(&config.price_ids);
        let gateway = StripeGateway::new(stripe);

        let store = EntitlementStore::new(pool.clone());
        let resolver = UserResolver::new(pool.clone());
        let events = EntitlementEventLogger::new(pool.clone());
        let engine = TransitionEngine::new(store.clone(), events.clone());

        Self {
            catalog: catalog.clone(),
            store: store.clone(),
            resolver: resolver.clone(),
            events: events.clone(),
            engine: engine.clone(),
            sync: CreditSynchronizer::new(store, events),
            cancellation: CancellationService::new(gateway.clone(), engine.clone()),
            webhooks: WebhookHandler::new(
                config.webhook_secret,
                pool.clone(),
                resolver,
                engine,
                catalog,
                gateway,
            ),
            invariants: InvariantChecker::new(pool),
        }
    }
}
