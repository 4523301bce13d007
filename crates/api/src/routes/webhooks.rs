//! Billing webhook endpoint
//!
//! The signature is checked before anything is persisted. Storage failures answer 500 so
//! the processor retries; the rolled-back ledger lets the retry apply cleanly.

use axum::{extract::State, http::HeaderMap, Json};
use shiftdesk_billing::{ReconcileOutcome, SIGNATURE_HEADER};
use time::OffsetDateTime;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<ReconcileOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Billing webhook without signature header");
            ApiError::InvalidSignature
        })?;

    let now = OffsetDateTime::now_utc();
    let event = state.billing.verifier.verify(&body, signature, now)?;
    let outcome = state.billing.reconciler.handle_event(&event, now).await?;

    Ok(Json(outcome))
}
