// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! End-to-end scenarios against the in-memory store:
//! - Tenant lifecycle (RECON-L01 to RECON-L03)
//! - Idempotency (RECON-I01 to RECON-I03)
//! - Out-of-order delivery (RECON-O01 to RECON-O03)
//! - Rollback (RECON-T01 to RECON-T02)
//! - Grace expiry and access (RECON-G01 to RECON-G03)

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use serde_json::json;
    use time::{Duration, OffsetDateTime};

    use crate::config::BillingConfig;
    use crate::events::BillingEvent;
    use crate::store::{BillingStore, MemoryBillingStore};
    use crate::tenant::{Tenant, TenantId};
    use crate::BillingService;

    pub const SECRET: &str = "whsec_edge_cases";

    pub fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    pub fn period_end() -> OffsetDateTime {
        t0() + Duration::days(30)
    }

    pub fn service(store: &Arc<MemoryBillingStore>) -> BillingService {
        BillingService::new(BillingConfig::new(SECRET), store.clone())
    }

    pub async fn pending_tenant(store: &MemoryBillingStore) -> TenantId {
        let tenant = Tenant::pending(TenantId::new(), t0());
        store.insert_tenant(&tenant).await.unwrap();
        tenant.tenant_id
    }

    fn event(event_id: &str, event_type: &str, payload: serde_json::Value) -> BillingEvent {
        let body = json!({
            "provider": "stripe",
            "event_id": event_id,
            "event_type": event_type,
            "payload": payload,
        });
        BillingEvent::from_json(&body.to_string()).unwrap()
    }

    pub fn checkout(event_id: &str, tenant_id: TenantId, period_end: OffsetDateTime) -> BillingEvent {
        event(
            event_id,
            "checkout.completed",
            json!({
                "tenant_id": tenant_id,
                "customer_id": "cus_1",
                "subscription_id": "sub_1",
                "plan_code": "team",
                "current_period_end": period_end.unix_timestamp(),
            }),
        )
    }

    pub fn paid(event_id: &str, period_end: OffsetDateTime) -> BillingEvent {
        event(
            event_id,
            "invoice.paid",
            json!({
                "subscription_id": "sub_1",
                "period_end": period_end.unix_timestamp(),
            }),
        )
    }

    pub fn failed(event_id: &str) -> BillingEvent {
        event(
            event_id,
            "invoice.payment_failed",
            json!({ "subscription_id": "sub_1", "attempt_count": 1 }),
        )
    }

    pub fn ended(event_id: &str, period_end: OffsetDateTime) -> BillingEvent {
        event(
            event_id,
            "subscription.ended",
            json!({
                "subscription_id": "sub_1",
                "current_period_end": period_end.unix_timestamp(),
            }),
        )
    }

    pub fn cancel_at_period_end(event_id: &str) -> BillingEvent {
        event(
            event_id,
            "subscription.updated",
            json!({
                "subscription_id": "sub_1",
                "cancel_at_period_end": true,
                "cancel_at": period_end().unix_timestamp(),
            }),
        )
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use std::sync::Arc;

    use time::Duration;

    use super::support::*;
    use crate::entitlement::EntitlementSource;
    use crate::store::{BillingStore, MemoryBillingStore};
    use crate::tenant::TenantStatus;
    use crate::transitions::TransitionAction;
    use crate::webhooks::ReconcileOutcome;

    // =========================================================================
    // RECON-L01: checkout, failed payment, end, replay, sweep
    // =========================================================================
    #[tokio::test]
    async fn test_full_lifecycle_scenario() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        // e1: checkout activates and creates the recurring grant
        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        let tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        let grants = store.entitlements_for_tenant(tenant_id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].source, EntitlementSource::RecurringBilling);
        assert_eq!(grants[0].ends_at, Some(period_end()));

        // e2: a failed charge changes nothing
        let outcome = billing
            .reconciler
            .handle_event(&failed("e2"), t0() + Duration::days(29))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                tenant_id,
                action: TransitionAction::PaymentFailureRecorded,
                from: TenantStatus::Active,
                to: TenantStatus::Active,
            }
        );

        // e3: subscription ended starts grace from the period end
        billing
            .reconciler
            .handle_event(&ended("e3", period_end()), period_end())
            .await
            .unwrap();
        let tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
        let grace_until = period_end() + Duration::days(14);
        assert_eq!(tenant.status, TenantStatus::Grace);
        assert_eq!(tenant.grace_until, Some(grace_until));

        // Replaying e1 is a duplicate
        let replay = billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), period_end())
            .await
            .unwrap();
        assert_eq!(replay, ReconcileOutcome::Duplicate);
        assert_eq!(store.count_ledger_entries().await.unwrap(), 3);
        let tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Grace);

        // Sweep just after the deadline suspends
        let report = billing
            .sweep
            .sweep(grace_until + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.transitioned, 1);
        let tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert!(tenant.grace_until.is_none());

        let audit = store.audit_log_for_tenant(tenant_id).await.unwrap();
        let actions: Vec<&str> = audit.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(
            actions,
            vec![
                "activated",
                "payment_failure_recorded",
                "grace_started",
                "grace_expired"
            ]
        );
    }

    // =========================================================================
    // RECON-L02: cancel flag keeps the tenant fully functional
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_at_period_end_keeps_tenant_active() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        billing
            .reconciler
            .handle_event(&cancel_at_period_end("e2"), t0() + Duration::days(1))
            .await
            .unwrap();

        let subscription = store
            .subscription_for_tenant(tenant_id)
            .await
            .unwrap()
            .unwrap();
        assert!(subscription.cancel_at_period_end);
        assert_eq!(subscription.cancel_at, Some(period_end()));
        assert_eq!(subscription.current_period_end, period_end());

        let decision = billing
            .access
            .access_level(tenant_id, t0() + Duration::days(2))
            .await
            .unwrap();
        assert_eq!(decision.status, TenantStatus::Active);
        assert!(decision.can_write());
    }

    // =========================================================================
    // RECON-L03: suspended tenant comes back through a new checkout
    // =========================================================================
    #[tokio::test]
    async fn test_new_checkout_reactivates_suspended_tenant() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        billing
            .reconciler
            .handle_event(&ended("e2", period_end()), period_end())
            .await
            .unwrap();
        let later = period_end() + Duration::days(20);
        billing.sweep.sweep(later).await.unwrap();

        let outcome = billing
            .reconciler
            .handle_event(
                &checkout("e3", tenant_id, later + Duration::days(30)),
                later,
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied {
                action: TransitionAction::Reactivated,
                from: TenantStatus::Suspended,
                to: TenantStatus::Active,
                ..
            }
        ));

        let decision = billing.access.access_level(tenant_id, later).await.unwrap();
        assert!(decision.can_write());
        assert_eq!(
            decision.resolution.effective().and_then(|e| e.ends_at),
            Some(later + Duration::days(30))
        );
    }
}

#[cfg(test)]
mod idempotency_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;

    use super::support::*;
    use crate::store::{BillingStore, MemoryBillingStore};
    use crate::webhooks::ReconcileOutcome;

    // =========================================================================
    // RECON-I01: same event twice in a row
    // =========================================================================
    #[tokio::test]
    async fn test_sequential_duplicate_changes_nothing() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        let tenant_once = store.get_tenant(tenant_id).await.unwrap();
        let grants_once = store.entitlements_for_tenant(tenant_id).await.unwrap();

        let second = billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();

        assert_eq!(second, ReconcileOutcome::Duplicate);
        assert_eq!(store.get_tenant(tenant_id).await.unwrap(), tenant_once);
        assert_eq!(
            store.entitlements_for_tenant(tenant_id).await.unwrap(),
            grants_once
        );
        assert_eq!(store.count_ledger_entries().await.unwrap(), 1);
        assert_eq!(store.audit_log_for_tenant(tenant_id).await.unwrap().len(), 1);
    }

    // =========================================================================
    // RECON-I02: 10 concurrent deliveries of the same event
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_duplicates_apply_once() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = Arc::new(service(&store));
        let tenant_id = pending_tenant(&store).await;

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];
        for _ in 0..10 {
            let billing = billing.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                billing
                    .reconciler
                    .handle_event(&checkout("e1", tenant_id, period_end()), t0())
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ReconcileOutcome::Applied { .. } => applied += 1,
                ReconcileOutcome::Duplicate => duplicates += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(duplicates, 9);
        assert_eq!(store.count_ledger_entries().await.unwrap(), 1);
        assert_eq!(store.entitlements_for_tenant(tenant_id).await.unwrap().len(), 1);
    }

    // =========================================================================
    // RECON-I03: redelivered checkout under a new event id
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_redelivered_with_new_id_keeps_single_grant() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        for event_id in ["e1", "e1-retry"] {
            billing
                .reconciler
                .handle_event(&checkout(event_id, tenant_id, period_end()), t0())
                .await
                .unwrap();
        }

        assert_eq!(store.count_ledger_entries().await.unwrap(), 2);
        let grants = store.entitlements_for_tenant(tenant_id).await.unwrap();
        assert_eq!(grants.len(), 1);
    }
}

#[cfg(test)]
mod ordering_tests {
    use std::sync::Arc;

    use time::Duration;

    use super::support::*;
    use crate::store::{BillingStore, MemoryBillingStore};
    use crate::tenant::TenantStatus;
    use crate::webhooks::{DiscardReason, ReconcileOutcome};

    // =========================================================================
    // RECON-O01: ended(P2) applied before succeeded(P1 < P2)
    // =========================================================================
    #[tokio::test]
    async fn test_late_earlier_payment_does_not_undo_grace() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;
        let p1 = period_end();
        let p2 = p1 + Duration::days(30);

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, p1), t0())
            .await
            .unwrap();
        billing
            .reconciler
            .handle_event(&ended("e3", p2), p1)
            .await
            .unwrap();
        billing
            .reconciler
            .handle_event(&paid("e2", p1), p1)
            .await
            .unwrap();

        let tenant = store.get_tenant(tenant_id).await.unwrap().unwrap();
        assert_eq!(tenant.status, TenantStatus::Grace);
        assert_eq!(tenant.grace_until, Some(p2 + Duration::days(14)));
    }

    // =========================================================================
    // RECON-O02: later renewal arriving before the earlier one
    // =========================================================================
    #[tokio::test]
    async fn test_renewals_out_of_order_keep_latest_period() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;
        let p2 = period_end() + Duration::days(30);
        let p3 = period_end() + Duration::days(60);

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        billing
            .reconciler
            .handle_event(&paid("e3", p3), t0())
            .await
            .unwrap();
        billing
            .reconciler
            .handle_event(&paid("e2", p2), t0())
            .await
            .unwrap();

        let subscription = store
            .subscription_for_tenant(tenant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subscription.current_period_end, p3);
        let grants = store.entitlements_for_tenant(tenant_id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].ends_at, Some(p3));
    }

    // =========================================================================
    // RECON-O03: payment before checkout is discarded, checkout converges
    // =========================================================================
    #[tokio::test]
    async fn test_payment_before_checkout_self_heals() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        let early = billing
            .reconciler
            .handle_event(&paid("e2", period_end()), t0())
            .await
            .unwrap();
        assert_eq!(
            early,
            ReconcileOutcome::Discarded {
                reason: DiscardReason::UnknownSubscription
            }
        );
        assert_eq!(
            store.get_tenant(tenant_id).await.unwrap().unwrap().status,
            TenantStatus::PendingPayment
        );

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        assert_eq!(
            store.get_tenant(tenant_id).await.unwrap().unwrap().status,
            TenantStatus::Active
        );
        assert_eq!(store.count_ledger_entries().await.unwrap(), 2);
    }
}

#[cfg(test)]
mod rollback_tests {
    use std::sync::Arc;

    use super::support::*;
    use crate::error::BillingError;
    use crate::store::{BillingStore, MemoryBillingStore};
    use crate::tenant::TenantStatus;
    use crate::webhooks::ReconcileOutcome;

    // =========================================================================
    // RECON-T01: storage failure mid-reconciliation forgets the event
    // =========================================================================
    #[tokio::test]
    async fn test_failed_reconciliation_rolls_back_ledger() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;
        store.fail_writes_for(tenant_id).await;

        let result = billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await;
        assert!(matches!(result, Err(BillingError::Database(_))));

        assert_eq!(store.count_ledger_entries().await.unwrap(), 0);
        assert!(store.subscription_for_tenant(tenant_id).await.unwrap().is_none());
        assert!(store.entitlements_for_tenant(tenant_id).await.unwrap().is_empty());
        assert_eq!(
            store.get_tenant(tenant_id).await.unwrap().unwrap().status,
            TenantStatus::PendingPayment
        );
    }

    // =========================================================================
    // RECON-T02: the provider's retry after recovery applies cleanly
    // =========================================================================
    #[tokio::test]
    async fn test_retry_after_failure_applies() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;
        store.fail_writes_for(tenant_id).await;

        let _ = billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await;
        store.clear_failures().await;

        let retry = billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        assert!(matches!(retry, ReconcileOutcome::Applied { .. }));
        assert_eq!(store.count_ledger_entries().await.unwrap(), 1);
        assert_eq!(
            store.get_tenant(tenant_id).await.unwrap().unwrap().status,
            TenantStatus::Active
        );
    }
}

#[cfg(test)]
mod grace_and_access_tests {
    use std::sync::Arc;

    use time::Duration;

    use super::support::*;
    use crate::entitlement::Entitlement;
    use crate::store::{BillingStore, MemoryBillingStore};
    use crate::tenant::{AccessLevel, Tenant, TenantId, TenantStatus};
    use crate::transitions::TransitionAction;
    use crate::webhooks::ReconcileOutcome;

    // =========================================================================
    // RECON-G01: grace one second past vs one hour ahead
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_boundaries() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);

        let mut lapsed = Tenant::active(TenantId::new(), t0());
        lapsed.enter_grace(t0() - Duration::seconds(1), t0());
        store.insert_tenant(&lapsed).await.unwrap();
        let mut waiting = Tenant::active(TenantId::new(), t0());
        waiting.enter_grace(t0() + Duration::hours(1), t0());
        store.insert_tenant(&waiting).await.unwrap();

        let report = billing.sweep.sweep(t0()).await.unwrap();
        assert_eq!(report.transitioned, 1);
        assert_eq!(
            store.get_tenant(lapsed.tenant_id).await.unwrap().unwrap().status,
            TenantStatus::Suspended
        );
        assert_eq!(
            store.get_tenant(waiting.tenant_id).await.unwrap().unwrap().status,
            TenantStatus::Grace
        );
    }

    // =========================================================================
    // RECON-G02: revoked key denies writes without any sweep
    // =========================================================================
    #[tokio::test]
    async fn test_revocation_takes_effect_immediately() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant = Tenant::active(TenantId::new(), t0());
        store.insert_tenant(&tenant).await.unwrap();
        let lifetime = Entitlement::one_time_key(tenant.tenant_id, "lifetime", t0(), None);
        store.insert_entitlement(lifetime.clone()).await;

        let before = billing.access.access_level(tenant.tenant_id, t0()).await.unwrap();
        assert_eq!(before.level, AccessLevel::ReadWrite);

        billing
            .admin
            .revoke_entitlement(lifetime.id, "ops", t0())
            .await
            .unwrap();

        let after = billing.access.access_level(tenant.tenant_id, t0()).await.unwrap();
        assert_eq!(after.status, TenantStatus::Active);
        assert_eq!(after.level, AccessLevel::ReadOnly);
        assert!(after.resolution.is_revoked());
    }

    // =========================================================================
    // RECON-G03: lifetime key keeps the tenant active past subscription end
    // =========================================================================
    #[tokio::test]
    async fn test_lifetime_key_outlives_subscription() {
        let store = Arc::new(MemoryBillingStore::new());
        let billing = service(&store);
        let tenant_id = pending_tenant(&store).await;

        billing
            .reconciler
            .handle_event(&checkout("e1", tenant_id, period_end()), t0())
            .await
            .unwrap();
        store
            .insert_entitlement(Entitlement::one_time_key(tenant_id, "lifetime", t0(), None))
            .await;

        let outcome = billing
            .reconciler
            .handle_event(&ended("e2", period_end()), period_end())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied {
                action: TransitionAction::RetainedByOtherEntitlement,
                to: TenantStatus::Active,
                ..
            }
        ));

        let later = period_end() + Duration::days(60);
        let decision = billing.access.access_level(tenant_id, later).await.unwrap();
        assert!(decision.can_write());

        let summary = billing.invariants.run_all_checks(later).await.unwrap();
        assert!(summary.healthy);
    }
}
