//! Tenant access query
//!
//! The single question the rest of the application asks before a mutating request:
//! what may this tenant do right now. Stored status gives the baseline; a revoked
//! entitlement forces suspended-equivalent treatment without waiting for any sweep.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entitlement::{resolve, Entitlement, Resolution};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;
use crate::tenant::{AccessLevel, Tenant, TenantId, TenantStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub tenant_id: TenantId,
    pub status: TenantStatus,
    pub level: AccessLevel,
    pub resolution: Resolution,
    #[serde(with = "time::serde::timestamp::option")]
    pub grace_until: Option<OffsetDateTime>,
}

impl AccessDecision {
    pub fn can_read(&self) -> bool {
        self.level.can_read()
    }

    pub fn can_write(&self) -> bool {
        self.level.can_write()
    }
}

/// Combine stored status with the resolver outcome
pub fn decide(tenant: &Tenant, entitlements: &[Entitlement], now: OffsetDateTime) -> AccessDecision {
    let resolution = resolve(entitlements, now);

    let level = match (&resolution, tenant.status) {
        (Resolution::Revoked { .. }, status) => TenantStatus::Suspended
            .access_level()
            .min(status.access_level()),
        (Resolution::NoGrant, TenantStatus::Active) => {
            tracing::debug!(
                tenant_id = %tenant.tenant_id,
                "Active tenant has no effective entitlement - limiting to read-only"
            );
            AccessLevel::ReadOnly
        }
        (_, status) => status.access_level(),
    };

    AccessDecision {
        tenant_id: tenant.tenant_id,
        status: tenant.status,
        level,
        resolution,
        grace_until: tenant.grace_until,
    }
}

#[derive(Clone)]
pub struct AccessService {
    store: Arc<dyn BillingStore>,
}

impl AccessService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn access_level(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
    ) -> BillingResult<AccessDecision> {
        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or(BillingError::TenantNotFound(tenant_id))?;
        let entitlements = self.store.entitlements_for_tenant(tenant_id).await?;

        Ok(decide(&tenant, &entitlements, now))
    }
}
