//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use shiftdesk_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    /// Storage failure; the processor should retry
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::InvalidPayload(msg) | BillingError::InvalidInput(msg) => {
                ApiError::BadRequest(msg)
            }
            BillingError::TenantNotFound(_) | BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::InvariantViolation(msg) | BillingError::Config(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "Invalid webhook signature"),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found"),
            ApiError::Database(_) | ApiError::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
