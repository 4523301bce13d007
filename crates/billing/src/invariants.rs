//! Billing Invariants Module
//!
//! Runnable consistency checks over tenant access state. They can be run after any
//! mutation, webhook replay or sweep to confirm the stored status still agrees with
//! the entitlement resolver.
//!
//! ## Design Principles
//!
//! 1. **Explanatory**: Violations include enough context to debug
//! 2. **Non-destructive**: Checks only read, never write

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entitlement::{resolve, Entitlement, Resolution};
use crate::error::BillingResult;
use crate::store::BillingStore;
use crate::subscriptions::Subscription;
use crate::tenant::{Tenant, TenantId, TenantStatus};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub tenant_ids: Vec<TenantId>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Tenant can write without paying, or the reverse
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::timestamp")]
    pub checked_at: OffsetDateTime,
    pub tenants_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// One tenant's rows, loaded once and shared by every check
struct TenantSnapshot {
    tenant: Tenant,
    subscription: Option<Subscription>,
    entitlements: Vec<Entitlement>,
}

type Check = fn(&TenantSnapshot, OffsetDateTime) -> Option<InvariantViolation>;

const CHECKS: &[(&str, Check)] = &[
    ("grace_deadline_matches_status", check_grace_deadline),
    ("active_has_effective_grant", check_active_has_grant),
    ("grace_not_overdue", check_grace_not_overdue),
    ("pending_without_subscription", check_pending_without_subscription),
    ("suspended_without_live_grant", check_suspended_without_grant),
];

/// Service for running billing invariant checks
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let snapshots = self.load_snapshots().await?;

        let mut violations = Vec::new();
        for (_, check) in CHECKS {
            violations.extend(snapshots.iter().filter_map(|s| check(s, now)));
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            tenants_checked: snapshots.len(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(
        &self,
        name: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let Some((_, check)) = CHECKS.iter().find(|(check_name, _)| *check_name == name) else {
            return Ok(vec![]);
        };
        let snapshots = self.load_snapshots().await?;
        Ok(snapshots.iter().filter_map(|s| check(s, now)).collect())
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|(name, _)| *name).collect()
    }

    async fn load_snapshots(&self) -> BillingResult<Vec<TenantSnapshot>> {
        let tenants = self.store.list_tenants().await?;
        let mut snapshots = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            let subscription = self.store.subscription_for_tenant(tenant.tenant_id).await?;
            let entitlements = self.store.entitlements_for_tenant(tenant.tenant_id).await?;
            snapshots.push(TenantSnapshot {
                tenant,
                subscription,
                entitlements,
            });
        }
        Ok(snapshots)
    }
}

fn violation(
    invariant: &str,
    snapshot: &TenantSnapshot,
    description: String,
    context: serde_json::Value,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        tenant_ids: vec![snapshot.tenant.tenant_id],
        description,
        context,
        severity,
    }
}

/// Invariant 1: `grace_until` is set iff the tenant is in grace
fn check_grace_deadline(s: &TenantSnapshot, _now: OffsetDateTime) -> Option<InvariantViolation> {
    s.tenant.check_invariant().err().map(|e| {
        violation(
            "grace_deadline_matches_status",
            s,
            e.to_string(),
            serde_json::json!({
                "status": s.tenant.status,
                "grace_until": s.tenant.grace_until.map(|t| t.unix_timestamp()),
            }),
            ViolationSeverity::Critical,
        )
    })
}

/// Invariant 2: an active tenant is backed by an effective entitlement
fn check_active_has_grant(s: &TenantSnapshot, now: OffsetDateTime) -> Option<InvariantViolation> {
    if s.tenant.status != TenantStatus::Active {
        return None;
    }
    match resolve(&s.entitlements, now) {
        Resolution::Effective { .. } => None,
        resolution => Some(violation(
            "active_has_effective_grant",
            s,
            "Active tenant has no effective entitlement".to_string(),
            serde_json::json!({
                "resolution": resolution,
                "entitlement_count": s.entitlements.len(),
            }),
            ViolationSeverity::High,
        )),
    }
}

/// Invariant 3: no tenant sits in grace past its deadline (sweep lagging)
fn check_grace_not_overdue(s: &TenantSnapshot, now: OffsetDateTime) -> Option<InvariantViolation> {
    if !s.tenant.grace_expired(now) {
        return None;
    }
    let overdue_secs = s
        .tenant
        .grace_until
        .map(|until| (now - until).whole_seconds())
        .unwrap_or_default();
    Some(violation(
        "grace_not_overdue",
        s,
        format!("Grace expired {}s ago but tenant is not suspended", overdue_secs),
        serde_json::json!({ "overdue_secs": overdue_secs }),
        ViolationSeverity::Medium,
    ))
}

/// Invariant 4: a checkout that created a subscription also activated the tenant
fn check_pending_without_subscription(
    s: &TenantSnapshot,
    _now: OffsetDateTime,
) -> Option<InvariantViolation> {
    if s.tenant.status != TenantStatus::PendingPayment {
        return None;
    }
    s.subscription.as_ref().map(|subscription| {
        violation(
            "pending_without_subscription",
            s,
            "Tenant awaiting payment already has a subscription".to_string(),
            serde_json::json!({
                "subscription_id": subscription.external_subscription_id,
                "subscription_status": subscription.status,
            }),
            ViolationSeverity::Medium,
        )
    })
}

/// Invariant 5: suspended tenants hold no live grant
fn check_suspended_without_grant(
    s: &TenantSnapshot,
    now: OffsetDateTime,
) -> Option<InvariantViolation> {
    if s.tenant.status != TenantStatus::Suspended {
        return None;
    }
    resolve(&s.entitlements, now).effective().map(|entitlement| {
        violation(
            "suspended_without_live_grant",
            s,
            "Suspended tenant still holds a live entitlement".to_string(),
            serde_json::json!({
                "entitlement_id": entitlement.id,
                "source": entitlement.source,
            }),
            ViolationSeverity::Low,
        )
    })
}
