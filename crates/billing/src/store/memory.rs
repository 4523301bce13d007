//! In-memory billing store
//!
//! Transactions are serialised behind one async mutex: `begin()` takes the lock, writes
//! go to a working copy, and `commit()` publishes the copy. Dropping a transaction
//! discards its writes, ledger insert included. Writes for tenants registered with
//! [`MemoryBillingStore::fail_writes_for`] return a database error.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, RecordOutcome};
use crate::store::{BillingStore, BillingTransaction};
use crate::subscriptions::Subscription;
use crate::tenant::{Tenant, TenantId, TenantStatus};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tenants: BTreeMap<TenantId, Tenant>,
    subscriptions: BTreeMap<TenantId, Subscription>,
    entitlements: BTreeMap<Uuid, Entitlement>,
    ledger: BTreeMap<(String, String), LedgerEntry>,
    audit: Vec<AuditEntry>,
    failing_tenants: HashSet<TenantId>,
}

impl MemoryState {
    fn ensure_writable(&self, tenant_id: TenantId) -> BillingResult<()> {
        if self.failing_tenants.contains(&tenant_id) {
            return Err(BillingError::Database(format!(
                "injected write failure for tenant {}",
                tenant_id
            )));
        }
        Ok(())
    }

    fn entitlements_for(&self, tenant_id: TenantId) -> Vec<Entitlement> {
        let mut entitlements: Vec<Entitlement> = self
            .entitlements
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entitlements.sort_by_key(|e| (e.starts_at, e.id));
        entitlements
    }
}

#[derive(Clone, Default)]
pub struct MemoryBillingStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `tenant_id` fail until cleared
    pub async fn fail_writes_for(&self, tenant_id: TenantId) {
        self.state.lock().await.failing_tenants.insert(tenant_id);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing_tenants.clear();
    }

    /// Seed an entitlement outside any reconciliation (license claims, fixtures)
    pub async fn insert_entitlement(&self, entitlement: Entitlement) {
        self.state
            .lock()
            .await
            .entitlements
            .insert(entitlement.id, entitlement);
    }
}

pub struct MemoryBillingTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl BillingTransaction for MemoryBillingTransaction {
    async fn record_event(&mut self, entry: &LedgerEntry) -> BillingResult<RecordOutcome> {
        let key = (entry.provider.clone(), entry.external_event_id.clone());
        if self.working.ledger.contains_key(&key) {
            return Ok(RecordOutcome::Duplicate);
        }
        self.working.ledger.insert(key, entry.clone());
        Ok(RecordOutcome::Accepted)
    }

    async fn lock_tenant(&mut self, tenant_id: TenantId) -> BillingResult<Option<Tenant>> {
        Ok(self.working.tenants.get(&tenant_id).cloned())
    }

    async fn find_subscription(
        &mut self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .working
            .subscriptions
            .values()
            .find(|s| s.external_subscription_id == external_subscription_id)
            .cloned())
    }

    async fn subscription_for_tenant(
        &mut self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.working.subscriptions.get(&tenant_id).cloned())
    }

    async fn entitlements_for_tenant(
        &mut self,
        tenant_id: TenantId,
    ) -> BillingResult<Vec<Entitlement>> {
        Ok(self.working.entitlements_for(tenant_id))
    }

    async fn get_entitlement(&mut self, id: Uuid) -> BillingResult<Option<Entitlement>> {
        Ok(self.working.entitlements.get(&id).cloned())
    }

    async fn save_tenant(&mut self, tenant: &Tenant) -> BillingResult<()> {
        tenant.check_invariant()?;
        self.working.ensure_writable(tenant.tenant_id)?;

        match self.working.tenants.get_mut(&tenant.tenant_id) {
            Some(existing) => {
                *existing = tenant.clone();
                Ok(())
            }
            None => Err(BillingError::TenantNotFound(tenant.tenant_id)),
        }
    }

    async fn save_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        self.working.ensure_writable(subscription.tenant_id)?;

        let taken_by_other = self.working.subscriptions.values().any(|s| {
            s.external_subscription_id == subscription.external_subscription_id
                && s.tenant_id != subscription.tenant_id
        });
        if taken_by_other {
            return Err(BillingError::Database(format!(
                "duplicate external_subscription_id {}",
                subscription.external_subscription_id
            )));
        }

        self.working
            .subscriptions
            .insert(subscription.tenant_id, subscription.clone());
        Ok(())
    }

    async fn save_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        self.working.ensure_writable(entitlement.tenant_id)?;

        let mut row = entitlement.clone();
        if let Some(existing) = self.working.entitlements.get(&entitlement.id) {
            row.revoked_at = existing.revoked_at.or(entitlement.revoked_at);
        }
        self.working.entitlements.insert(row.id, row);
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> BillingResult<()> {
        self.working.ensure_writable(entry.tenant_id)?;
        self.working.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryBillingTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryBillingTransaction { guard, working }))
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> BillingResult<()> {
        tenant.check_invariant()?;

        let mut state = self.state.lock().await;
        if state.tenants.contains_key(&tenant.tenant_id) {
            return Err(BillingError::Database(format!(
                "duplicate tenant {}",
                tenant.tenant_id
            )));
        }
        state.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Tenant>> {
        Ok(self.state.lock().await.tenants.get(&tenant_id).cloned())
    }

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>> {
        let state = self.state.lock().await;
        let mut tenants: Vec<Tenant> = state.tenants.values().cloned().collect();
        tenants.sort_by_key(|t| (t.created_at, t.tenant_id));
        Ok(tenants)
    }

    async fn subscription_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&tenant_id).cloned())
    }

    async fn entitlements_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Vec<Entitlement>> {
        Ok(self.state.lock().await.entitlements_for(tenant_id))
    }

    async fn expired_grace_tenants(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantId>> {
        let state = self.state.lock().await;
        let mut expired: Vec<(OffsetDateTime, TenantId)> = state
            .tenants
            .values()
            .filter(|t| t.status == TenantStatus::Grace)
            .filter_map(|t| t.grace_until.filter(|until| *until < now).map(|u| (u, t.tenant_id)))
            .collect();
        expired.sort();
        Ok(expired.into_iter().map(|(_, id)| id).collect())
    }

    async fn count_ledger_entries(&self) -> BillingResult<u64> {
        Ok(self.state.lock().await.ledger.len() as u64)
    }

    async fn prune_ledger(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before_count = state.ledger.len();
        state.ledger.retain(|_, entry| entry.received_at >= before);
        Ok((before_count - state.ledger.len()) as u64)
    }

    async fn audit_log_for_tenant(&self, tenant_id: TenantId) -> BillingResult<Vec<AuditEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .audit
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn entry(event_id: &str, received_at: OffsetDateTime) -> LedgerEntry {
        LedgerEntry::new(
            "stripe",
            event_id,
            "invoice.paid",
            serde_json::json!({}),
            received_at,
        )
    }

    #[tokio::test]
    async fn test_duplicate_ledger_insert_is_reported() {
        let store = MemoryBillingStore::new();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.record_event(&entry("evt_1", now())).await.unwrap(),
            RecordOutcome::Accepted
        );
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.record_event(&entry("evt_1", now())).await.unwrap(),
            RecordOutcome::Duplicate
        );
        drop(tx);

        assert_eq!(store.count_ledger_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_event_id_from_other_provider_is_distinct() {
        let store = MemoryBillingStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.record_event(&entry("evt_1", now())).await.unwrap();
        let mut other = entry("evt_1", now());
        other.provider = "paddle".to_string();
        assert_eq!(
            tx.record_event(&other).await.unwrap(),
            RecordOutcome::Accepted
        );
        tx.commit().await.unwrap();
        assert_eq!(store.count_ledger_entries().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryBillingStore::new();
        let tenant = Tenant::pending(TenantId::new(), now());
        store.insert_tenant(&tenant).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            tx.record_event(&entry("evt_1", now())).await.unwrap();
            let mut locked = tx.lock_tenant(tenant.tenant_id).await.unwrap().unwrap();
            locked.activate(now());
            tx.save_tenant(&locked).await.unwrap();
        }

        assert_eq!(store.count_ledger_entries().await.unwrap(), 0);
        let reloaded = store.get_tenant(tenant.tenant_id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TenantStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_save_entitlement_never_clears_revocation() {
        let store = MemoryBillingStore::new();
        let tenant_id = TenantId::new();
        let mut grant = Entitlement::one_time_key(tenant_id, "lifetime", now(), None);
        grant.revoked_at = Some(now());
        store.insert_entitlement(grant.clone()).await;

        let mut tx = store.begin().await.unwrap();
        let mut cleared = grant.clone();
        cleared.revoked_at = None;
        tx.save_entitlement(&cleared).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.entitlements_for_tenant(tenant_id).await.unwrap();
        assert_eq!(stored[0].revoked_at, Some(now()));
    }

    #[tokio::test]
    async fn test_prune_ledger_keeps_recent_rows() {
        let store = MemoryBillingStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.record_event(&entry("evt_old", now() - Duration::days(60)))
            .await
            .unwrap();
        tx.record_event(&entry("evt_new", now())).await.unwrap();
        tx.commit().await.unwrap();

        let pruned = store.prune_ledger(now() - Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.count_ledger_entries().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_tenant_rejects_broken_invariant() {
        let store = MemoryBillingStore::new();
        let mut tenant = Tenant::active(TenantId::new(), now());
        store.insert_tenant(&tenant).await.unwrap();

        tenant.grace_until = Some(now());
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.save_tenant(&tenant).await,
            Err(BillingError::InvariantViolation(_))
        ));
    }
}
