//! API routes

pub mod admin;
pub mod billing;
pub mod entitlements;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/ready", get(health::readiness));

    // Public API routes - the webhook authenticates via signature, the
    // cancellation endpoint is called by the product UI on behalf of a
    // signed-in user (session auth terminates at the edge proxy)
    let api_routes = Router::new()
        .route("/billing/webhook", post(billing::webhook))
        .route("/billing/cancel", post(billing::cancel_subscription))
        .route("/entitlements/:user_id", get(entitlements::get_entitlement))
        .route(
            "/internal/credits/consume",
            post(entitlements::consume_credit),
        );

    // Admin routes, guarded by the shared admin token
    let admin_routes = Router::new()
        .route("/admin/entitlements/adjust", post(admin::adjust_entitlement))
        .route(
            "/admin/entitlements/:user_id",
            get(admin::entitlement_detail),
        )
        .route("/admin/sync", post(admin::run_sync))
        .route("/admin/invariants", get(admin::run_invariants))
        .route("/admin/webhooks/failures", get(admin::webhook_failures));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes.merge(admin_routes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
