//! Subscription record
//!
//! Mirrors the payment processor's view of a tenant's recurring charge. One row per
//! tenant; only the webhook reconciler writes it.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::tenant::TenantId;

/// Processor lifecycle vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Trialing,
    Incomplete,
}

impl SubscriptionStatus {
    /// Canceled subscriptions never come back; a new checkout creates a new one
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::PastDue => write!(f, "past_due"),
            SubscriptionStatus::Canceled => write!(f, "canceled"),
            SubscriptionStatus::Unpaid => write!(f, "unpaid"),
            SubscriptionStatus::Trialing => write!(f, "trialing"),
            SubscriptionStatus::Incomplete => write!(f, "incomplete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub tenant_id: TenantId,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    /// Plan purchased at checkout, reused when a renewal re-creates the grant
    pub plan_code: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::timestamp")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::timestamp::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::timestamp")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Only ever moves the period boundary forward
    ///
    /// Returns true when the boundary advanced.
    pub fn advance_period(&mut self, period_end: OffsetDateTime, now: OffsetDateTime) -> bool {
        if period_end <= self.current_period_end {
            return false;
        }
        self.current_period_end = period_end;
        self.updated_at = now;
        true
    }

    /// Mirror an upstream status change, ignoring anything after cancellation
    pub fn mirror_status(&mut self, status: SubscriptionStatus, now: OffsetDateTime) -> bool {
        if self.status == status || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.updated_at = now;
        true
    }
}
