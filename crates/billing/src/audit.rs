//! Billing audit log
//!
//! Every tenant-affecting change made by this crate appends one row, written in the
//! same transaction as the change itself.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::tenant::{TenantId, TenantStatus};

/// Who caused the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Payment processor webhook
    Processor,
    /// Grace-expiry sweep
    Scheduler,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub action: String,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub from_status: Option<TenantStatus>,
    pub to_status: Option<TenantStatus>,
    pub provider: Option<String>,
    pub external_event_id: Option<String>,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
pub struct AuditEntryBuilder {
    entry: AuditEntry,
}

impl AuditEntryBuilder {
    pub fn new(tenant_id: TenantId, action: impl Into<String>, actor_type: ActorType) -> Self {
        Self {
            entry: AuditEntry {
                id: Uuid::new_v4(),
                tenant_id,
                action: action.into(),
                actor_type,
                actor_id: None,
                from_status: None,
                to_status: None,
                provider: None,
                external_event_id: None,
                details: serde_json::Value::Null,
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.entry.actor_id = Some(actor_id.into());
        self
    }

    pub fn status_change(mut self, from: TenantStatus, to: TenantStatus) -> Self {
        self.entry.from_status = Some(from);
        self.entry.to_status = Some(to);
        self
    }

    pub fn external_event(mut self, provider: &str, event_id: &str) -> Self {
        self.entry.provider = Some(provider.to_string());
        self.entry.external_event_id = Some(event_id.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.entry.details = details;
        self
    }

    pub fn at(mut self, created_at: OffsetDateTime) -> Self {
        self.entry.created_at = created_at;
        self
    }

    pub fn build(self) -> AuditEntry {
        self.entry
    }
}
