//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde_json::json;

use crate::state::AppState;

/// Basic liveness check
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: verifies database connectivity
pub async fn readiness(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let db_ok: Result<(i32,), _> = sqlx::query_as("SELECT 1")
        .fetch_one(&state.pool)
        .await;

    match db_ok {
        Ok(_) => Ok(Json(json!({
            "status": "ready",
            "billing": state.billing.is_some(),
        }))),
        Err(e) => {
            tracing::error!(error = %e, "Readiness check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
