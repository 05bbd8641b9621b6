//! Entitlement read and credit consumption endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use stageright_shared::{PlanType, SubscriptionStatus};

use crate::{error::ApiError, state::AppState};

/// Entitlement view returned to the product UI
#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub photos_limit: i32,
    pub photos_used: i32,
    pub credits_remaining: i32,
    pub subscription_status: SubscriptionStatus,
    pub subscription_end_date: Option<OffsetDateTime>,
}

/// Read a user's entitlement.
///
/// Expiry is checked lazily here: a canceled subscription whose end date
/// has passed is reset to free-tier defaults before the response is built.
pub async fn get_entitlement(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    if let Some(expired) = billing.engine.expire_if_lapsed(user_id).await? {
        return Ok(Json(to_response(expired)));
    }

    let entitlement = billing
        .store
        .get(user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(to_response(entitlement)))
}

fn to_response(ent: stageright_shared::Entitlement) -> EntitlementResponse {
    EntitlementResponse {
        user_id: ent.user_id,
        plan_type: ent.plan_type,
        photos_limit: ent.photos_limit,
        photos_used: ent.photos_used,
        credits_remaining: ent.credits_remaining(),
        subscription_status: ent.subscription_status,
        subscription_end_date: ent.subscription_end_date,
    }
}

/// Request from the rendering pipeline to consume one credit
#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
}

/// Atomically consume one photo credit.
///
/// Called by the staging pipeline before rendering; the guarded decrement
/// can never drive remaining credits negative.
pub async fn consume_credit(
    State(state): State<AppState>,
    Json(req): Json<ConsumeRequest>,
) -> Result<Json<stageright_billing::ConsumeOutcome>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let outcome = billing.store.consume_photo(req.user_id).await?;

    if !outcome.allowed {
        tracing::info!(
            user_id = %req.user_id,
            remaining = outcome.remaining,
            "Credit consume denied - no credits remaining"
        );
    }

    Ok(Json(outcome))
}
