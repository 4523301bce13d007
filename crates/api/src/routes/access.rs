//! Tenant access query
//!
//! Consulted by every mutating request handler elsewhere in the application.

use axum::{
    extract::{Path, State},
    Json,
};
use shiftdesk_billing::{AccessDecision, TenantId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

pub async fn tenant_access(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<AccessDecision>> {
    let decision = state
        .billing
        .access
        .access_level(TenantId(tenant_id), OffsetDateTime::now_utc())
        .await?;

    Ok(Json(decision))
}
