//! Tenant state transitions
//!
//! Pure functions computing what a single billing event does to one tenant's account.
//! The reconciler loads an [`Account`] under the tenant lock, asks this module for a
//! [`Transition`] and writes it back in the same transaction.
//!
//! Every rule is order tolerant: period boundaries only move forward, grace deadlines only
//! move later, and a canceled subscription only comes back through a newer paid period.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::entitlement::{resolve, Entitlement, EntitlementSource};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutCompleted, PaymentFailed, PaymentSucceeded, SubscriptionEnded, SubscriptionUpdated,
};
use crate::subscriptions::{Subscription, SubscriptionStatus};
use crate::tenant::{Tenant, TenantStatus};

/// Everything one event may touch, loaded under the tenant row lock
#[derive(Debug, Clone)]
pub struct Account {
    pub tenant: Tenant,
    pub subscription: Option<Subscription>,
    pub entitlements: Vec<Entitlement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    /// First checkout for a pending tenant
    Activated,
    /// Checkout bringing a grace or suspended tenant back
    Reactivated,
    /// Checkout for an active tenant with a different subscription
    SubscriptionReplaced,
    Renewed,
    /// Payment while in grace
    Recovered,
    /// Payment for a suspended tenant; only a new checkout reactivates
    PeriodRecorded,
    /// Payment for a period already covered
    StalePaymentIgnored,
    PaymentFailureRecorded,
    SubscriptionUpdated,
    /// Update for a canceled subscription
    StaleUpdateIgnored,
    GraceStarted,
    GraceExtended,
    /// Subscription ended but another grant keeps the tenant active
    RetainedByOtherEntitlement,
    /// Subscription ended for a tenant that was not active
    EndedWhileInactive,
}

impl TransitionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionAction::Activated => "activated",
            TransitionAction::Reactivated => "reactivated",
            TransitionAction::SubscriptionReplaced => "subscription_replaced",
            TransitionAction::Renewed => "renewed",
            TransitionAction::Recovered => "recovered",
            TransitionAction::PeriodRecorded => "period_recorded",
            TransitionAction::StalePaymentIgnored => "stale_payment_ignored",
            TransitionAction::PaymentFailureRecorded => "payment_failure_recorded",
            TransitionAction::SubscriptionUpdated => "subscription_updated",
            TransitionAction::StaleUpdateIgnored => "stale_update_ignored",
            TransitionAction::GraceStarted => "grace_started",
            TransitionAction::GraceExtended => "grace_extended",
            TransitionAction::RetainedByOtherEntitlement => "retained_by_other_entitlement",
            TransitionAction::EndedWhileInactive => "ended_while_inactive",
        }
    }
}

impl std::fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes produced by one event
#[derive(Debug, Clone)]
pub struct Transition {
    pub action: TransitionAction,
    pub from: TenantStatus,
    /// Tenant after the event; saved only when it differs from the loaded row
    pub tenant: Tenant,
    /// Subscription to upsert, if it changed
    pub subscription: Option<Subscription>,
    /// Entitlements to insert or update
    pub entitlements: Vec<Entitlement>,
    pub details: serde_json::Value,
}

impl Transition {
    fn unchanged(account: &Account, action: TransitionAction) -> Self {
        Self {
            action,
            from: account.tenant.status,
            tenant: account.tenant.clone(),
            subscription: None,
            entitlements: Vec::new(),
            details: serde_json::Value::Null,
        }
    }

    pub fn to(&self) -> TenantStatus {
        self.tenant.status
    }

    pub fn tenant_changed(&self, before: &Tenant) -> bool {
        self.tenant.status != before.status || self.tenant.grace_until != before.grace_until
    }
}

/// Checkout: activate the tenant under the purchased subscription
///
/// A repeat checkout for the subscription an active tenant already runs on is treated as
/// a renewal so a redelivered checkout with a new event id cannot reset anything.
pub fn checkout_completed(
    account: &Account,
    checkout: &CheckoutCompleted,
    now: OffsetDateTime,
) -> Transition {
    if let Some(subscription) = &account.subscription {
        if account.tenant.status == TenantStatus::Active
            && subscription.external_subscription_id == checkout.subscription_id
        {
            return renew(account, subscription, checkout.current_period_end, now);
        }
    }

    let from = account.tenant.status;
    let mut tenant = account.tenant.clone();
    tenant.activate(now);

    let subscription = Subscription {
        tenant_id: tenant.tenant_id,
        external_customer_id: checkout.customer_id.clone(),
        external_subscription_id: checkout.subscription_id.clone(),
        plan_code: checkout.plan_code.clone(),
        status: checkout.status,
        current_period_end: checkout.current_period_end,
        cancel_at_period_end: false,
        cancel_at: None,
        updated_at: now,
    };

    // Close whatever recurring grant the previous subscription left behind
    let mut entitlements: Vec<Entitlement> = account
        .entitlements
        .iter()
        .filter(|e| e.source == EntitlementSource::RecurringBilling && e.is_live(now))
        .cloned()
        .map(|mut e| {
            e.ends_at = Some(now);
            e
        })
        .collect();
    entitlements.push(Entitlement::recurring(
        tenant.tenant_id,
        checkout.plan_code.clone(),
        now,
        checkout.current_period_end,
    ));

    let action = match from {
        TenantStatus::PendingPayment => TransitionAction::Activated,
        TenantStatus::Active => TransitionAction::SubscriptionReplaced,
        TenantStatus::Grace | TenantStatus::Suspended => TransitionAction::Reactivated,
    };

    Transition {
        action,
        from,
        tenant,
        details: serde_json::json!({
            "subscription_id": checkout.subscription_id,
            "plan_code": checkout.plan_code,
            "current_period_end": checkout.current_period_end.unix_timestamp(),
            "closed_entitlements": entitlements.len() - 1,
        }),
        subscription: Some(subscription),
        entitlements,
    }
}

/// Payment confirmation for a period
pub fn payment_succeeded(
    account: &Account,
    subscription: &Subscription,
    payment: &PaymentSucceeded,
    now: OffsetDateTime,
) -> Transition {
    renew(account, subscription, payment.period_end, now)
}

fn renew(
    account: &Account,
    subscription: &Subscription,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> Transition {
    let mut subscription = subscription.clone();
    if !subscription.advance_period(period_end, now) {
        let mut transition = Transition::unchanged(account, TransitionAction::StalePaymentIgnored);
        transition.details = serde_json::json!({
            "period_end": period_end.unix_timestamp(),
            "current_period_end": subscription.current_period_end.unix_timestamp(),
        });
        return transition;
    }
    // A newer paid period proves the subscription is live again
    subscription.status = SubscriptionStatus::Active;

    let from = account.tenant.status;
    let mut tenant = account.tenant.clone();
    let action = match from {
        TenantStatus::Active => TransitionAction::Renewed,
        TenantStatus::Grace => {
            tenant.activate(now);
            TransitionAction::Recovered
        }
        TenantStatus::PendingPayment => {
            tenant.activate(now);
            TransitionAction::Activated
        }
        TenantStatus::Suspended => TransitionAction::PeriodRecorded,
    };

    let entitlements = if tenant.status == TenantStatus::Active {
        vec![extend_recurring(account, &subscription, period_end, now)]
    } else {
        Vec::new()
    };

    Transition {
        action,
        from,
        tenant,
        details: serde_json::json!({
            "subscription_id": subscription.external_subscription_id,
            "period_end": period_end.unix_timestamp(),
        }),
        subscription: Some(subscription),
        entitlements,
    }
}

/// Push the live recurring grant out to `period_end`, or start a new one if it lapsed
fn extend_recurring(
    account: &Account,
    subscription: &Subscription,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> Entitlement {
    let live = account
        .entitlements
        .iter()
        .filter(|e| e.source == EntitlementSource::RecurringBilling && e.is_live(now))
        .max_by_key(|e| e.ends_at);

    match live {
        Some(existing) => {
            let mut extended = existing.clone();
            extended.ends_at = match existing.ends_at {
                Some(ends_at) if ends_at >= period_end => Some(ends_at),
                _ => Some(period_end),
            };
            extended
        }
        None => Entitlement::recurring(
            account.tenant.tenant_id,
            subscription.plan_code.clone(),
            now,
            period_end,
        ),
    }
}

/// A failed charge starts the processor's retry cadence; nothing changes here
pub fn payment_failed(account: &Account, failure: &PaymentFailed) -> Transition {
    let mut transition = Transition::unchanged(account, TransitionAction::PaymentFailureRecorded);
    transition.details = serde_json::json!({
        "subscription_id": failure.subscription_id,
        "attempt_count": failure.attempt_count,
        "next_attempt_at": failure.next_attempt_at.map(|t| t.unix_timestamp()),
    });
    transition
}

/// Cancellation flags and status mirror; never touches the tenant or the period
pub fn subscription_updated(
    account: &Account,
    subscription: &Subscription,
    update: &SubscriptionUpdated,
    now: OffsetDateTime,
) -> Transition {
    if subscription.status.is_terminal() {
        return Transition::unchanged(account, TransitionAction::StaleUpdateIgnored);
    }

    let mut subscription = subscription.clone();
    subscription.cancel_at_period_end = update.cancel_at_period_end;
    subscription.cancel_at = update.cancel_at;
    subscription.updated_at = now;
    if let Some(status) = update.status {
        subscription.mirror_status(status, now);
    }

    let mut transition = Transition::unchanged(account, TransitionAction::SubscriptionUpdated);
    transition.details = serde_json::json!({
        "subscription_id": subscription.external_subscription_id,
        "status": subscription.status,
        "cancel_at_period_end": subscription.cancel_at_period_end,
        "cancel_at": subscription.cancel_at.map(|t| t.unix_timestamp()),
    });
    transition.subscription = Some(subscription);
    transition
}

/// Terminal signal: start the grace window from the later of the known period ends
///
/// Fails when the grace deadline falls outside the representable range.
pub fn subscription_ended(
    account: &Account,
    subscription: &Subscription,
    ended: &SubscriptionEnded,
    grace_window: Duration,
    now: OffsetDateTime,
) -> BillingResult<Transition> {
    let mut subscription = subscription.clone();
    subscription.advance_period(ended.current_period_end, now);
    subscription.status = SubscriptionStatus::Canceled;
    subscription.updated_at = now;

    let period_end = subscription.current_period_end;
    let grace_until = period_end.checked_add(grace_window).ok_or_else(|| {
        BillingError::InvalidPayload(format!(
            "current_period_end {} is out of range",
            period_end.unix_timestamp()
        ))
    })?;

    let from = account.tenant.status;
    let mut tenant = account.tenant.clone();
    let action = match from {
        TenantStatus::Active => {
            let other_grants = account
                .entitlements
                .iter()
                .filter(|e| e.source != EntitlementSource::RecurringBilling);
            if resolve(other_grants, now).effective().is_some() {
                TransitionAction::RetainedByOtherEntitlement
            } else {
                tenant.enter_grace(grace_until, now);
                TransitionAction::GraceStarted
            }
        }
        TenantStatus::Grace => {
            let until = match tenant.grace_until {
                Some(existing) if existing >= grace_until => existing,
                _ => grace_until,
            };
            tenant.enter_grace(until, now);
            TransitionAction::GraceExtended
        }
        TenantStatus::PendingPayment | TenantStatus::Suspended => {
            TransitionAction::EndedWhileInactive
        }
    };

    Ok(Transition {
        action,
        from,
        details: serde_json::json!({
            "subscription_id": subscription.external_subscription_id,
            "current_period_end": period_end.unix_timestamp(),
            "grace_until": tenant.grace_until.map(|t| t.unix_timestamp()),
        }),
        tenant,
        subscription: Some(subscription),
        entitlements: Vec::new(),
    })
}
