//! Inbound billing events
//!
//! The processor delivers a signed envelope `{provider, event_id, event_type, payload}`.
//! Known event types are decoded into typed payloads before anything touches the ledger,
//! so a malformed delivery is rejected without side effects.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::SubscriptionStatus;
use crate::tenant::TenantId;

/// Envelope as delivered to the webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    /// When the provider created the event, if it says
    #[serde(default, with = "time::serde::timestamp::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// First successful checkout for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutCompleted {
    pub tenant_id: Uuid,
    pub customer_id: String,
    pub subscription_id: String,
    pub plan_code: String,
    #[serde(with = "time::serde::timestamp")]
    pub current_period_end: OffsetDateTime,
    #[serde(default)]
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub subscription_id: String,
    /// End of the period this payment covers
    #[serde(with = "time::serde::timestamp")]
    pub period_end: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub subscription_id: String,
    #[serde(default)]
    pub attempt_count: Option<u32>,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub next_attempt_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdated {
    pub subscription_id: String,
    #[serde(default)]
    pub status: Option<SubscriptionStatus>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub cancel_at: Option<OffsetDateTime>,
}

/// Terminal signal: no further retries, the subscription is over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEnded {
    pub subscription_id: String,
    #[serde(with = "time::serde::timestamp")]
    pub current_period_end: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEventKind {
    CheckoutCompleted(CheckoutCompleted),
    PaymentSucceeded(PaymentSucceeded),
    PaymentFailed(PaymentFailed),
    SubscriptionUpdated(SubscriptionUpdated),
    SubscriptionEnded(SubscriptionEnded),
    /// Recorded in the ledger, otherwise ignored
    Unhandled,
}

impl BillingEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            BillingEventKind::CheckoutCompleted(_) => "checkout_completed",
            BillingEventKind::PaymentSucceeded(_) => "payment_succeeded",
            BillingEventKind::PaymentFailed(_) => "payment_failed",
            BillingEventKind::SubscriptionUpdated(_) => "subscription_updated",
            BillingEventKind::SubscriptionEnded(_) => "subscription_ended",
            BillingEventKind::Unhandled => "unhandled",
        }
    }
}

/// A decoded, not yet reconciled event
#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub envelope: WebhookEnvelope,
    pub kind: BillingEventKind,
}

impl BillingEvent {
    pub fn from_envelope(envelope: WebhookEnvelope) -> BillingResult<Self> {
        if envelope.provider.trim().is_empty() {
            return Err(BillingError::InvalidPayload(
                "provider must not be empty".to_string(),
            ));
        }
        if envelope.event_id.trim().is_empty() {
            return Err(BillingError::InvalidPayload(
                "event_id must not be empty".to_string(),
            ));
        }

        let payload = envelope.payload.clone();
        let kind = match envelope.event_type.as_str() {
            "checkout.completed" => {
                BillingEventKind::CheckoutCompleted(serde_json::from_value(payload)?)
            }
            "invoice.paid" | "invoice.payment_succeeded" => {
                BillingEventKind::PaymentSucceeded(serde_json::from_value(payload)?)
            }
            "invoice.payment_failed" => {
                BillingEventKind::PaymentFailed(serde_json::from_value(payload)?)
            }
            "subscription.updated" => {
                BillingEventKind::SubscriptionUpdated(serde_json::from_value(payload)?)
            }
            "subscription.ended" | "subscription.deleted" => {
                BillingEventKind::SubscriptionEnded(serde_json::from_value(payload)?)
            }
            _ => BillingEventKind::Unhandled,
        };

        Ok(Self { envelope, kind })
    }

    /// Parse a raw JSON body
    pub fn from_json(body: &str) -> BillingResult<Self> {
        let envelope: WebhookEnvelope = serde_json::from_str(body)?;
        Self::from_envelope(envelope)
    }

    pub fn provider(&self) -> &str {
        &self.envelope.provider
    }

    pub fn event_id(&self) -> &str {
        &self.envelope.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.envelope.event_type
    }

    /// Tenant named directly by the payload (checkout only)
    pub fn tenant_ref(&self) -> Option<TenantId> {
        match &self.kind {
            BillingEventKind::CheckoutCompleted(c) => Some(TenantId(c.tenant_id)),
            _ => None,
        }
    }

    /// Processor subscription the event is about
    pub fn subscription_ref(&self) -> Option<&str> {
        match &self.kind {
            BillingEventKind::CheckoutCompleted(c) => Some(&c.subscription_id),
            BillingEventKind::PaymentSucceeded(p) => Some(&p.subscription_id),
            BillingEventKind::PaymentFailed(p) => Some(&p.subscription_id),
            BillingEventKind::SubscriptionUpdated(u) => Some(&u.subscription_id),
            BillingEventKind::SubscriptionEnded(e) => Some(&e.subscription_id),
            BillingEventKind::Unhandled => None,
        }
    }
}
