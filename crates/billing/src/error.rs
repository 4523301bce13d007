//! Billing error types

use thiserror::Error;

use crate::tenant::TenantId;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A write would leave a row in a state the data model forbids
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl BillingError {
    /// Client errors are never retried by the event source
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureInvalid
                | BillingError::InvalidPayload(_)
                | BillingError::InvalidInput(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidPayload(err.to_string())
    }
}
