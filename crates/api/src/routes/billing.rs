//! Billing routes: Stripe webhook intake and user cancellation

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use stageright_billing::CancellationOutcome;

use crate::{error::ApiError, state::AppState};

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    // Verify and parse event
    let envelope = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
        ApiError::BadRequest("Invalid webhook signature".to_string())
    })?;

    tracing::info!(
        event_type = %envelope.event_type,
        event_id = %envelope.id,
        "Stripe webhook event verified"
    );

    billing.webhooks.handle_event(envelope).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        ApiError::Database(format!("Webhook handling error: {}", e))
    })?;

    Ok(StatusCode::OK)
}

/// Request to cancel a subscription
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: Uuid,
    pub subscription_id: Option<String>,
}

/// Cancel the user's subscription.
///
/// Succeeds for every valid user id; billing-provider failures degrade to a
/// local-only cancellation rather than an error response.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancellationOutcome>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let outcome = billing
        .cancellation
        .cancel(req.user_id, req.subscription_id)
        .await?;

    Ok(Json(outcome))
}
