//! Grace-expiry sweep
//!
//! Moves tenants whose grace window lapsed to `suspended`. Each tenant gets its own
//! transaction; one failure is reported and the sweep carries on. Re-running is harmless
//! because the row is re-checked under its lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::audit::{ActorType, AuditEntryBuilder};
use crate::error::BillingResult;
use crate::store::BillingStore;
use crate::tenant::TenantId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    pub tenant_id: TenantId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Tenants selected as expired
    pub candidates: usize,
    /// Tenants moved to `suspended`
    pub transitioned: usize,
    pub failures: Vec<SweepFailure>,
}

#[derive(Clone)]
pub struct GraceExpirySweep {
    store: Arc<dyn BillingStore>,
}

impl GraceExpirySweep {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Suspend every tenant with `status = grace AND grace_until < now`
    ///
    /// Only the selection query can fail the whole sweep.
    pub async fn sweep(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let candidates = self.store.expired_grace_tenants(now).await?;
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for tenant_id in candidates {
            match self.suspend_tenant(tenant_id, now).await {
                Ok(true) => report.transitioned += 1,
                Ok(false) => {
                    tracing::debug!(
                        tenant_id = %tenant_id,
                        "Tenant no longer in expired grace, skipping"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Failed to suspend tenant after grace expiry"
                    );
                    report.failures.push(SweepFailure {
                        tenant_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            candidates = report.candidates,
            transitioned = report.transitioned,
            failures = report.failures.len(),
            "Grace-expiry sweep finished"
        );

        Ok(report)
    }

    /// Returns false when the tenant changed since selection
    async fn suspend_tenant(&self, tenant_id: TenantId, now: OffsetDateTime) -> BillingResult<bool> {
        let mut tx = self.store.begin().await?;

        let Some(mut tenant) = tx.lock_tenant(tenant_id).await? else {
            return Ok(false);
        };
        if !tenant.grace_expired(now) {
            return Ok(false);
        }

        let from = tenant.status;
        let grace_until = tenant.grace_until.map(|t| t.unix_timestamp());
        tenant.suspend(now);
        tx.save_tenant(&tenant).await?;

        let audit = AuditEntryBuilder::new(tenant_id, "grace_expired", ActorType::Scheduler)
            .status_change(from, tenant.status)
            .details(serde_json::json!({ "grace_until": grace_until }))
            .at(now)
            .build();
        tx.append_audit(&audit).await?;

        tx.commit().await?;

        tracing::info!(tenant_id = %tenant_id, "Tenant suspended after grace expiry");
        Ok(true)
    }
}
