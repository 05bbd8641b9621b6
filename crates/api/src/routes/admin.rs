//! Admin override and reconciliation endpoints
//!
//! All routes here require the shared admin token in `x-admin-token`.
//! These are support tooling: manual credit grants, drift repair, and
//! consistency checks.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use stageright_billing::{
    EntitlementEvent, EventContext, InvariantCheckSummary, LimitChange, ProfileRow, SyncOutcome,
    SyncReport, WebhookEventRecord,
};
use stageright_shared::{Entitlement, PlanType};

use crate::{error::ApiError, state::AppState};

fn require_admin(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = state.config.admin_api_token.as_bytes();
    if provided.as_bytes().ct_eq(expected).into() {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Request to adjust a user's entitlement
#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub user_id: Uuid,
    pub plan_type: Option<PlanType>,
    /// Interpreted per `mode`
    pub photos_limit: Option<i32>,
    /// "absolute" (default) or "delta"
    pub mode: Option<String>,
}

/// Apply a support override: set a plan and/or grant or revoke credits
pub async fn adjust_entitlement(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdjustRequest>,
) -> Result<Json<Entitlement>, ApiError> {
    require_admin(&headers, &state)?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let limit_change = match (req.photos_limit, req.mode.as_deref()) {
        (Some(value), Some("delta")) => Some(LimitChange::Delta(value)),
        (Some(value), _) => Some(LimitChange::Absolute(value)),
        (None, _) => None,
    };

    if req.plan_type.is_none() && limit_change.is_none() {
        return Err(ApiError::BadRequest(
            "Nothing to adjust: provide plan_type and/or photos_limit".to_string(),
        ));
    }

    let entitlement = billing
        .engine
        .admin_adjust(
            req.user_id,
            req.plan_type,
            limit_change,
            &EventContext::admin(),
        )
        .await?;

    Ok(Json(entitlement))
}

/// Both stores' view of one user, with drift status and recent history
#[derive(Debug, Serialize)]
pub struct EntitlementDetail {
    pub primary: Option<Entitlement>,
    pub mirror: Option<ProfileRow>,
    pub drifted: bool,
    pub recent_events: Vec<EntitlementEvent>,
}

pub async fn entitlement_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
) -> Result<Json<EntitlementDetail>, ApiError> {
    require_admin(&headers, &state)?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let primary = billing.store.get(user_id).await?;
    let mirror = billing.store.secondary(user_id).await?;

    let drifted = match (&primary, &mirror) {
        (Some(p), Some(m)) => p.plan_type != m.plan_type || p.photos_limit != m.photos_limit,
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    };

    let recent_events = billing.events.recent_for_user(user_id, 25).await?;

    Ok(Json(EntitlementDetail {
        primary,
        mirror,
        drifted,
        recent_events,
    }))
}

/// Request to run the credit synchronizer
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub user_id: Option<Uuid>,
}

/// Sync response: either a single outcome or a full-pass report
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Single { user_id: Uuid, outcome: SyncOutcome },
    Full(SyncReport),
}

/// Run the credit synchronizer for one user or for all users
pub async fn run_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    require_admin(&headers, &state)?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    match req.user_id {
        Some(user_id) => {
            let outcome = billing.sync.sync_user(user_id).await?;
            Ok(Json(SyncResponse::Single { user_id, outcome }))
        }
        None => {
            let report = billing.sync.sync_all().await?;
            Ok(Json(SyncResponse::Full(report)))
        }
    }
}

/// Run all entitlement invariant checks
pub async fn run_invariants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    require_admin(&headers, &state)?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let summary = billing.invariants.run_all_checks().await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct FailuresQuery {
    pub limit: Option<i64>,
}

/// Webhook events that failed or could not be matched to a user
pub async fn webhook_failures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FailuresQuery>,
) -> Result<Json<Vec<WebhookEventRecord>>, ApiError> {
    require_admin(&headers, &state)?;
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let rows = billing
        .webhooks
        .recent_failures(query.limit.unwrap_or(50).clamp(1, 500))
        .await?;

    Ok(Json(rows))
}
