//! Administrative operations
//!
//! Revocation and manual status overrides. Both are audited with the acting admin.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{ActorType, AuditEntryBuilder};
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;
use crate::tenant::{Tenant, TenantId, TenantStatus};

#[derive(Clone)]
pub struct AdminService {
    store: Arc<dyn BillingStore>,
}

impl AdminService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Revoke one entitlement
    ///
    /// Touches only the entitlement row, so it never waits on subscription state. Revoking
    /// an already revoked grant returns it unchanged.
    pub async fn revoke_entitlement(
        &self,
        entitlement_id: Uuid,
        actor: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlement> {
        let mut tx = self.store.begin().await?;

        let mut entitlement = tx
            .get_entitlement(entitlement_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("entitlement {}", entitlement_id)))?;

        if entitlement.is_revoked() {
            return Ok(entitlement);
        }

        entitlement.revoked_at = Some(now);
        tx.save_entitlement(&entitlement).await?;

        let audit = AuditEntryBuilder::new(
            entitlement.tenant_id,
            "entitlement_revoked",
            ActorType::Admin,
        )
        .actor_id(actor)
        .details(serde_json::json!({
            "entitlement_id": entitlement.id,
            "plan_code": entitlement.plan_code,
            "source": entitlement.source,
        }))
        .at(now)
        .build();
        tx.append_audit(&audit).await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %entitlement.tenant_id,
            entitlement_id = %entitlement.id,
            actor = %actor,
            "Entitlement revoked"
        );

        Ok(entitlement)
    }

    /// Force a tenant into `status`
    ///
    /// `grace_until` must be given for `grace` and only for `grace`.
    pub async fn override_status(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
        grace_until: Option<OffsetDateTime>,
        actor: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Tenant> {
        match (status, grace_until) {
            (TenantStatus::Grace, None) => {
                return Err(BillingError::InvalidInput(
                    "grace_until is required for grace".to_string(),
                ))
            }
            (TenantStatus::Grace, Some(_)) | (_, None) => {}
            (other, Some(_)) => {
                return Err(BillingError::InvalidInput(format!(
                    "grace_until is only allowed for grace, not {}",
                    other
                )))
            }
        }

        let mut tx = self.store.begin().await?;
        let mut tenant = tx
            .lock_tenant(tenant_id)
            .await?
            .ok_or(BillingError::TenantNotFound(tenant_id))?;

        let from = tenant.status;
        tenant.status = status;
        tenant.grace_until = grace_until;
        tenant.updated_at = now;
        tx.save_tenant(&tenant).await?;

        let audit = AuditEntryBuilder::new(tenant_id, "status_override", ActorType::Admin)
            .actor_id(actor)
            .status_change(from, status)
            .details(serde_json::json!({
                "grace_until": grace_until.map(|t| t.unix_timestamp()),
            }))
            .at(now)
            .build();
        tx.append_audit(&audit).await?;

        tx.commit().await?;

        tracing::warn!(
            tenant_id = %tenant_id,
            from = %from,
            to = %status,
            actor = %actor,
            "Tenant status overridden by admin"
        );

        Ok(tenant)
    }
}
