//! Storage contracts
//!
//! All tenant-affecting writes happen through a [`BillingTransaction`]: a scoped unit of
//! work that rolls back when dropped without [`BillingTransaction::commit`]. Ledger insert,
//! tenant, subscription, entitlement and audit writes for one event share a single
//! transaction; cross-tenant work never does.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::entitlement::Entitlement;
use crate::error::BillingResult;
use crate::ledger::{LedgerEntry, RecordOutcome};
use crate::subscriptions::Subscription;
use crate::tenant::{Tenant, TenantId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

/// One open transaction
#[async_trait]
pub trait BillingTransaction: Send {
    /// Insert into the idempotency ledger, relying on the `(provider, external_event_id)`
    /// uniqueness constraint
    async fn record_event(&mut self, entry: &LedgerEntry) -> BillingResult<RecordOutcome>;

    /// Load a tenant and hold its row lock until the transaction ends
    async fn lock_tenant(&mut self, tenant_id: TenantId) -> BillingResult<Option<Tenant>>;

    async fn find_subscription(
        &mut self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn subscription_for_tenant(
        &mut self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>>;

    async fn entitlements_for_tenant(
        &mut self,
        tenant_id: TenantId,
    ) -> BillingResult<Vec<Entitlement>>;

    async fn get_entitlement(&mut self, id: Uuid) -> BillingResult<Option<Entitlement>>;

    /// Rejects rows breaking the `grace_until` invariant
    async fn save_tenant(&mut self, tenant: &Tenant) -> BillingResult<()>;

    /// Insert or replace the tenant's single subscription row
    async fn save_subscription(&mut self, subscription: &Subscription) -> BillingResult<()>;

    /// Insert or update; an existing `revoked_at` is never cleared
    async fn save_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()>;

    async fn append_audit(&mut self, entry: &AuditEntry) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}

/// Entry point to billing persistence
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>>;

    async fn insert_tenant(&self, tenant: &Tenant) -> BillingResult<()>;

    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Tenant>>;

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>>;

    async fn subscription_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>>;

    async fn entitlements_for_tenant(&self, tenant_id: TenantId)
        -> BillingResult<Vec<Entitlement>>;

    /// Tenants with `status = grace AND grace_until < now`
    async fn expired_grace_tenants(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantId>>;

    async fn count_ledger_entries(&self) -> BillingResult<u64>;

    /// Retention: delete ledger rows received before `before`
    async fn prune_ledger(&self, before: OffsetDateTime) -> BillingResult<u64>;

    async fn audit_log_for_tenant(&self, tenant_id: TenantId) -> BillingResult<Vec<AuditEntry>>;
}
