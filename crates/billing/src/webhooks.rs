//! Billing webhook handling
//!
//! Verifies the signed envelope, gates on the idempotency ledger and reconciles the
//! tenant's subscription, entitlements and access state in one transaction.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::audit::{ActorType, AuditEntryBuilder};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, BillingEventKind};
use crate::ledger::{self, LedgerEntry, RecordOutcome};
use crate::store::{BillingStore, BillingTransaction};
use crate::tenant::{TenantId, TenantStatus};
use crate::transitions::{self, Account, Transition, TransitionAction};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `t=<unix>,v1=<hex hmac>`
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Verifies the shared-secret signature on inbound envelopes
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn from_config(config: &BillingConfig) -> Self {
        Self::new(config.webhook_secret.clone(), config.signature_tolerance)
    }

    /// Header value for `body` signed at `timestamp`
    pub fn sign(&self, body: &str, timestamp: i64) -> BillingResult<String> {
        let mut mac = self.mac()?;
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("t={},v1={}", timestamp, signature))
    }

    /// Verify the signature header and decode the envelope
    ///
    /// Nothing is persisted here; a rejected delivery leaves no trace besides the log line.
    pub fn verify(
        &self,
        body: &str,
        signature_header: &str,
        now: OffsetDateTime,
    ) -> BillingResult<BillingEvent> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature_header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => v1_signature = Some(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let age = now
            .unix_timestamp()
            .checked_sub(timestamp)
            .and_then(i64::checked_abs)
            .ok_or_else(|| {
                tracing::warn!(timestamp = timestamp, "Webhook timestamp out of range");
                BillingError::WebhookSignatureInvalid
            })?;
        if age > self.tolerance.whole_seconds() {
            tracing::warn!(
                timestamp = timestamp,
                now = now.unix_timestamp(),
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = hex::decode(v1_signature).map_err(|_| {
            tracing::warn!("Signature is not valid hex");
            BillingError::WebhookSignatureInvalid
        })?;

        let mut mac = self.mac()?;
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        mac.verify_slice(&expected).map_err(|_| {
            tracing::warn!(payload_len = body.len(), "Signature mismatch");
            BillingError::WebhookSignatureInvalid
        })?;

        let event = BillingEvent::from_json(body)?;

        tracing::debug!(
            provider = %event.provider(),
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            "Webhook signature verified"
        );

        Ok(event)
    }

    fn mac(&self) -> BillingResult<HmacSha256> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))
    }
}

/// Why an accepted event changed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// No subscription row yet; the checkout event will establish it
    UnknownSubscription,
    UnknownTenant,
    UnhandledEventType,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::UnknownSubscription => write!(f, "unknown_subscription"),
            DiscardReason::UnknownTenant => write!(f, "unknown_tenant"),
            DiscardReason::UnhandledEventType => write!(f, "unhandled_event_type"),
        }
    }
}

/// What handling one delivery did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Already in the ledger; nothing re-applied
    Duplicate,
    Applied {
        tenant_id: TenantId,
        action: TransitionAction,
        from: TenantStatus,
        to: TenantStatus,
    },
    /// Recorded in the ledger, no other effect
    Discarded { reason: DiscardReason },
}

/// Applies verified events to tenant state
#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BillingStore>,
    grace_window: Duration,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn BillingStore>, grace_window: Duration) -> Self {
        Self {
            store,
            grace_window,
        }
    }

    /// Handle a verified event
    ///
    /// The ledger insert is the first write of the transaction. Any failure after it drops
    /// the transaction, so the event is forgotten and the provider's retry starts clean.
    pub async fn handle_event(
        &self,
        event: &BillingEvent,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let mut tx = self.store.begin().await?;

        let entry = LedgerEntry::new(
            event.provider(),
            event.event_id(),
            event.event_type(),
            event.envelope.payload.clone(),
            now,
        );
        if ledger::record(&mut *tx, &entry).await? == RecordOutcome::Duplicate {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let outcome = match self.reconcile(&mut *tx, event, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    provider = %event.provider(),
                    event_id = %event.event_id(),
                    event_type = %event.event_type(),
                    error = %e,
                    "Webhook reconciliation failed - rolling back"
                );
                return Err(e);
            }
        };

        tx.commit().await?;

        match &outcome {
            ReconcileOutcome::Applied {
                tenant_id,
                action,
                from,
                to,
            } => tracing::info!(
                tenant_id = %tenant_id,
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                action = %action,
                from = %from,
                to = %to,
                "Billing event applied"
            ),
            ReconcileOutcome::Discarded { reason } => tracing::warn!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                reason = %reason,
                "Billing event discarded"
            ),
            ReconcileOutcome::Duplicate => {}
        }

        Ok(outcome)
    }

    async fn reconcile(
        &self,
        tx: &mut dyn BillingTransaction,
        event: &BillingEvent,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let tenant_id = match (&event.kind, event.tenant_ref()) {
            (BillingEventKind::Unhandled, _) => {
                tracing::info!(
                    event_type = %event.event_type(),
                    event_id = %event.event_id(),
                    "Unhandled billing event type"
                );
                return Ok(discarded(DiscardReason::UnhandledEventType));
            }
            (_, Some(tenant_id)) => tenant_id,
            (_, None) => {
                let subscription_id = event.subscription_ref().unwrap_or_default();
                match tx.find_subscription(subscription_id).await? {
                    Some(subscription) => subscription.tenant_id,
                    None => return Ok(discarded(DiscardReason::UnknownSubscription)),
                }
            }
        };

        let Some(tenant) = tx.lock_tenant(tenant_id).await? else {
            return Ok(discarded(DiscardReason::UnknownTenant));
        };
        let subscription = tx.subscription_for_tenant(tenant_id).await?;
        let entitlements = tx.entitlements_for_tenant(tenant_id).await?;
        let account = Account {
            tenant,
            subscription,
            entitlements,
        };

        let transition = match &event.kind {
            BillingEventKind::CheckoutCompleted(checkout) => {
                transitions::checkout_completed(&account, checkout, now)
            }
            kind => {
                // Re-check under the lock; the tenant may have moved to another subscription
                let current = account
                    .subscription
                    .as_ref()
                    .filter(|s| Some(s.external_subscription_id.as_str()) == event.subscription_ref());
                let Some(subscription) = current else {
                    return Ok(discarded(DiscardReason::UnknownSubscription));
                };

                match kind {
                    BillingEventKind::PaymentSucceeded(payment) => {
                        transitions::payment_succeeded(&account, subscription, payment, now)
                    }
                    BillingEventKind::PaymentFailed(failure) => {
                        transitions::payment_failed(&account, failure)
                    }
                    BillingEventKind::SubscriptionUpdated(update) => {
                        transitions::subscription_updated(&account, subscription, update, now)
                    }
                    BillingEventKind::SubscriptionEnded(ended) => transitions::subscription_ended(
                        &account,
                        subscription,
                        ended,
                        self.grace_window,
                        now,
                    )?,
                    BillingEventKind::CheckoutCompleted(_) | BillingEventKind::Unhandled => {
                        return Ok(discarded(DiscardReason::UnhandledEventType))
                    }
                }
            }
        };

        if transition.action == TransitionAction::PeriodRecorded {
            tracing::warn!(
                tenant_id = %tenant_id,
                event_id = %event.event_id(),
                "Payment received for suspended tenant - a new checkout is required"
            );
        }

        apply(tx, &account, &transition, event, now).await?;

        Ok(ReconcileOutcome::Applied {
            tenant_id,
            action: transition.action,
            from: transition.from,
            to: transition.to(),
        })
    }
}

fn discarded(reason: DiscardReason) -> ReconcileOutcome {
    ReconcileOutcome::Discarded { reason }
}

/// Write a transition and its audit row
async fn apply(
    tx: &mut dyn BillingTransaction,
    account: &Account,
    transition: &Transition,
    event: &BillingEvent,
    now: OffsetDateTime,
) -> BillingResult<()> {
    if transition.tenant_changed(&account.tenant) {
        tx.save_tenant(&transition.tenant).await?;
    }
    if let Some(subscription) = &transition.subscription {
        tx.save_subscription(subscription).await?;
    }
    for entitlement in &transition.entitlements {
        tx.save_entitlement(entitlement).await?;
    }

    let audit = AuditEntryBuilder::new(
        account.tenant.tenant_id,
        transition.action.as_str(),
        ActorType::Processor,
    )
    .status_change(transition.from, transition.to())
    .external_event(event.provider(), event.event_id())
    .details(transition.details.clone())
    .at(now)
    .build();
    tx.append_audit(&audit).await
}
