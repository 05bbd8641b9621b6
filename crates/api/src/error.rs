//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use stageright_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication
    #[error("Authentication required")]
    Unauthorized,

    // Validation
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resources
    #[error("Resource not found")]
    NotFound,

    // Internal
    #[error("Database error: {0}")]
    Database(String),
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                self.to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database error surfaced to API");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Internal server error".to_string(),
                )
            }
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::NotFound(_) | BillingError::UserResolution { .. } => ApiError::NotFound,
            other => ApiError::Database(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
