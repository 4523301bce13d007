//! Tenant access state
//!
//! The tenant row is the coarse-grained gate consulted by every write path in the
//! application. Only the webhook reconciler, the grace-expiry sweep and administrative
//! overrides move it between states.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Tenant ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Stored tenant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Awaiting first checkout
    PendingPayment,
    Active,
    /// Subscription ended; read-only until `grace_until`
    Grace,
    Suspended,
}

impl TenantStatus {
    pub fn permits_read(&self) -> bool {
        matches!(
            self,
            TenantStatus::Active | TenantStatus::Grace | TenantStatus::Suspended
        )
    }

    pub fn permits_write(&self) -> bool {
        matches!(self, TenantStatus::Active)
    }

    pub fn access_level(&self) -> AccessLevel {
        if self.permits_write() {
            AccessLevel::ReadWrite
        } else if self.permits_read() {
            AccessLevel::ReadOnly
        } else {
            AccessLevel::NoAccess
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantStatus::PendingPayment => write!(f, "pending_payment"),
            TenantStatus::Active => write!(f, "active"),
            TenantStatus::Grace => write!(f, "grace"),
            TenantStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(TenantStatus::PendingPayment),
            "active" => Ok(TenantStatus::Active),
            "grace" => Ok(TenantStatus::Grace),
            "suspended" => Ok(TenantStatus::Suspended),
            other => Err(BillingError::InvalidInput(format!(
                "unknown tenant status '{}'",
                other
            ))),
        }
    }
}

/// What a request handler may do for a tenant, ordered from least to most
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

impl AccessLevel {
    pub fn can_read(&self) -> bool {
        !matches!(self, AccessLevel::NoAccess)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, AccessLevel::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub status: TenantStatus,
    /// Present only while `status = grace`
    #[serde(with = "time::serde::timestamp::option")]
    pub grace_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Tenant {
    /// A tenant awaiting its first checkout
    pub fn pending(tenant_id: TenantId, now: OffsetDateTime) -> Self {
        Self {
            tenant_id,
            status: TenantStatus::PendingPayment,
            grace_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A tenant created directly active (license-key claim)
    pub fn active(tenant_id: TenantId, now: OffsetDateTime) -> Self {
        Self {
            status: TenantStatus::Active,
            ..Self::pending(tenant_id, now)
        }
    }

    pub fn activate(&mut self, now: OffsetDateTime) {
        self.status = TenantStatus::Active;
        self.grace_until = None;
        self.updated_at = now;
    }

    pub fn enter_grace(&mut self, grace_until: OffsetDateTime, now: OffsetDateTime) {
        self.status = TenantStatus::Grace;
        self.grace_until = Some(grace_until);
        self.updated_at = now;
    }

    pub fn suspend(&mut self, now: OffsetDateTime) {
        self.status = TenantStatus::Suspended;
        self.grace_until = None;
        self.updated_at = now;
    }

    /// True once the grace window has lapsed
    pub fn grace_expired(&self, now: OffsetDateTime) -> bool {
        self.status == TenantStatus::Grace && self.grace_until.is_some_and(|until| until < now)
    }

    /// `grace_until` is non-null iff `status = grace`
    pub fn check_invariant(&self) -> BillingResult<()> {
        let in_grace = self.status == TenantStatus::Grace;
        if in_grace != self.grace_until.is_some() {
            return Err(BillingError::InvariantViolation(format!(
                "tenant {} has status {} with grace_until {:?}",
                self.tenant_id, self.status, self.grace_until
            )));
        }
        Ok(())
    }
}
