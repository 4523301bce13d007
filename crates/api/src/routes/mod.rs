//! HTTP routes

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub mod access;
pub mod health;
pub mod webhooks;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .route("/tenants/{tenant_id}/access", get(access::tenant_access))
        .with_state(state)
}
