//! Idempotency ledger
//!
//! Every externally delivered billing event is recorded exactly once, keyed by
//! `(provider, external_event_id)`. The insert is the only dedup gate and runs inside
//! the same transaction as the reconciliation it guards, so a rolled-back reconciliation
//! also forgets the event and the provider's retry gets a clean attempt.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingTransaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub provider: String,
    pub external_event_id: String,
    pub event_type: String,
    /// Raw payload snapshot as delivered
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::timestamp")]
    pub received_at: OffsetDateTime,
}

impl LedgerEntry {
    pub fn new(
        provider: impl Into<String>,
        external_event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            external_event_id: external_event_id.into(),
            event_type: event_type.into(),
            payload,
            received_at,
        }
    }
}

/// Result of the check-and-insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Newly persisted; the caller must reconcile
    Accepted,
    /// Already seen; the caller must short-circuit
    Duplicate,
}

/// Record an event in the ledger within `tx`
///
/// Atomicity comes from the storage uniqueness constraint, never from a prior read.
pub async fn record(
    tx: &mut dyn BillingTransaction,
    entry: &LedgerEntry,
) -> BillingResult<RecordOutcome> {
    let outcome = tx.record_event(entry).await?;

    match outcome {
        RecordOutcome::Accepted => tracing::debug!(
            provider = %entry.provider,
            event_id = %entry.external_event_id,
            event_type = %entry.event_type,
            "Ledger entry recorded"
        ),
        RecordOutcome::Duplicate => tracing::info!(
            provider = %entry.provider,
            event_id = %entry.external_event_id,
            event_type = %entry.event_type,
            "Duplicate webhook event - already in ledger"
        ),
    }

    Ok(outcome)
}
