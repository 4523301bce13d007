// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ShiftDesk Billing Module
//!
//! Keeps each tenant's access state consistent with the payment processor's
//! at-least-once, possibly reordered webhook stream and with one-time license keys.
//!
//! ## Features
//!
//! - **Idempotency Ledger**: every delivered event is recorded exactly once
//! - **Entitlement Resolver**: picks the single effective grant, revocation first
//! - **Webhook Reconciler**: one transaction per event across ledger, subscription,
//!   entitlements, tenant and audit log
//! - **Grace-Expiry Sweep**: suspends tenants whose grace window lapsed
//! - **Access Query**: read/write decision consulted by every mutating request
//! - **Invariants**: runnable consistency checks

pub mod access;
pub mod admin;
pub mod audit;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod store;
pub mod subscriptions;
pub mod sweep;
pub mod tenant;
pub mod transitions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Access
pub use access::{AccessDecision, AccessService};

// Admin
pub use admin::AdminService;

// Audit
pub use audit::{ActorType, AuditEntry, AuditEntryBuilder};

// Config
pub use config::BillingConfig;

// Entitlement
pub use entitlement::{resolve, Entitlement, EntitlementSource, Resolution};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, BillingEventKind, WebhookEnvelope};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{LedgerEntry, RecordOutcome};

// Store
pub use store::{BillingStore, BillingTransaction, MemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{Subscription, SubscriptionStatus};

// Sweep
pub use sweep::{GraceExpirySweep, SweepFailure, SweepReport};

// Tenant
pub use tenant::{AccessLevel, Tenant, TenantId, TenantStatus};

// Transitions
pub use transitions::TransitionAction;

// Webhooks
pub use webhooks::{
    DiscardReason, ReconcileOutcome, WebhookReconciler, WebhookVerifier, SIGNATURE_HEADER,
};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub verifier: WebhookVerifier,
    pub reconciler: WebhookReconciler,
    pub sweep: GraceExpirySweep,
    pub access: AccessService,
    pub admin: AdminService,
    pub invariants: InvariantChecker,
    store: Arc<dyn BillingStore>,
}

impl BillingService {
    /// Create a billing service from environment variables on top of `store`
    pub fn from_env(store: Arc<dyn BillingStore>) -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?, store))
    }

    /// Create a billing service with explicit config
    pub fn new(config: BillingConfig, store: Arc<dyn BillingStore>) -> Self {
        Self {
            verifier: WebhookVerifier::from_config(&config),
            reconciler: WebhookReconciler::new(store.clone(), config.grace_window),
            sweep: GraceExpirySweep::new(store.clone()),
            access: AccessService::new(store.clone()),
            admin: AdminService::new(store.clone()),
            invariants: InvariantChecker::new(store.clone()),
            config,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }
}
