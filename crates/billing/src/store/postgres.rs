//! Postgres-backed billing store
//!
//! Tenant rows are locked with `SELECT ... FOR NO KEY UPDATE` for the lifetime of the
//! transaction, so a webhook and the grace sweep touching the same tenant serialise on
//! an ordinary row lock. The weaker mode leaves foreign-key checks from other
//! transactions (audit rows written by a revocation) free to proceed. The ledger's uniqueness constraint makes a concurrently
//! delivered duplicate wait for the first transaction and then conflict.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerEntry, RecordOutcome};
use crate::store::{BillingStore, BillingTransaction};
use crate::subscriptions::Subscription;
use crate::tenant::{Tenant, TenantId};

const TENANT_COLUMNS: &str = "tenant_id, status, grace_until, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "tenant_id, external_customer_id, external_subscription_id, \
     plan_code, status, current_period_end, cancel_at_period_end, cancel_at, updated_at";

const ENTITLEMENT_COLUMNS: &str =
    "id, tenant_id, plan_code, source, starts_at, ends_at, revoked_at";

const AUDIT_COLUMNS: &str = "id, tenant_id, action, actor_type, actor_id, from_status, \
     to_status, provider, external_event_id, details, created_at";

/// Create a database connection pool
pub async fn connect(database_url: &str, max_connections: u32) -> BillingResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Database pool created");
    Ok(pool)
}

/// Apply the billing schema migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(format!("migration failed: {}", e)))?;
    tracing::info!("Billing migrations applied");
    Ok(())
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub struct PgBillingTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingTransaction for PgBillingTransaction {
    async fn record_event(&mut self, entry: &LedgerEntry) -> BillingResult<RecordOutcome> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_ledger
                (id, provider, external_event_id, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider, external_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(entry.id)
        .bind(&entry.provider)
        .bind(&entry.external_event_id)
        .bind(&entry.event_type)
        .bind(&entry.payload)
        .bind(entry.received_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(match inserted {
            Some(_) => RecordOutcome::Accepted,
            None => RecordOutcome::Duplicate,
        })
    }

    async fn lock_tenant(&mut self, tenant_id: TenantId) -> BillingResult<Option<Tenant>> {
        let tenant: Option<Tenant> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants WHERE tenant_id = $1 FOR NO KEY UPDATE",
            TENANT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(tenant)
    }

    async fn find_subscription(
        &mut self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(external_subscription_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(subscription)
    }

    async fn subscription_for_tenant(
        &mut self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(subscription)
    }

    async fn entitlements_for_tenant(
        &mut self,
        tenant_id: TenantId,
    ) -> BillingResult<Vec<Entitlement>> {
        let entitlements: Vec<Entitlement> = sqlx::query_as(&format!(
            "SELECT {} FROM entitlements WHERE tenant_id = $1 ORDER BY starts_at, id",
            ENTITLEMENT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(entitlements)
    }

    async fn get_entitlement(&mut self, id: Uuid) -> BillingResult<Option<Entitlement>> {
        let entitlement: Option<Entitlement> = sqlx::query_as(&format!(
            "SELECT {} FROM entitlements WHERE id = $1 FOR UPDATE",
            ENTITLEMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(entitlement)
    }

    async fn save_tenant(&mut self, tenant: &Tenant) -> BillingResult<()> {
        tenant.check_invariant()?;

        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET status = $2, grace_until = $3, updated_at = $4
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant.tenant_id)
        .bind(tenant.status)
        .bind(tenant.grace_until)
        .bind(tenant.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::TenantNotFound(tenant.tenant_id));
        }
        Ok(())
    }

    async fn save_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (tenant_id, external_customer_id, external_subscription_id, plan_code,
                 status, current_period_end, cancel_at_period_end, cancel_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id) DO UPDATE SET
                external_customer_id = EXCLUDED.external_customer_id,
                external_subscription_id = EXCLUDED.external_subscription_id,
                plan_code = EXCLUDED.plan_code,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                cancel_at = EXCLUDED.cancel_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(subscription.tenant_id)
        .bind(&subscription.external_customer_id)
        .bind(&subscription.external_subscription_id)
        .bind(&subscription.plan_code)
        .bind(subscription.status)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.cancel_at)
        .bind(subscription.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn save_entitlement(&mut self, entitlement: &Entitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements
                (id, tenant_id, plan_code, source, starts_at, ends_at, revoked_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                plan_code = EXCLUDED.plan_code,
                starts_at = EXCLUDED.starts_at,
                ends_at = EXCLUDED.ends_at,
                revoked_at = COALESCE(entitlements.revoked_at, EXCLUDED.revoked_at)
            "#,
        )
        .bind(entitlement.id)
        .bind(entitlement.tenant_id)
        .bind(&entitlement.plan_code)
        .bind(entitlement.source)
        .bind(entitlement.starts_at)
        .bind(entitlement.ends_at)
        .bind(entitlement.revoked_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO billing_audit_log ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            AUDIT_COLUMNS
        ))
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(&entry.action)
        .bind(entry.actor_type)
        .bind(&entry.actor_id)
        .bind(entry.from_status)
        .bind(entry.to_status)
        .bind(&entry.provider)
        .bind(&entry.external_event_id)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgBillingTransaction { tx }))
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> BillingResult<()> {
        tenant.check_invariant()?;

        sqlx::query(&format!(
            "INSERT INTO tenants ({}) VALUES ($1, $2, $3, $4, $5)",
            TENANT_COLUMNS
        ))
        .bind(tenant.tenant_id)
        .bind(tenant.status)
        .bind(tenant.grace_until)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Option<Tenant>> {
        let tenant: Option<Tenant> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants WHERE tenant_id = $1",
            TENANT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tenant)
    }

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>> {
        let tenants: Vec<Tenant> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants ORDER BY created_at",
            TENANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(tenants)
    }

    async fn subscription_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn entitlements_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Vec<Entitlement>> {
        let entitlements: Vec<Entitlement> = sqlx::query_as(&format!(
            "SELECT {} FROM entitlements WHERE tenant_id = $1 ORDER BY starts_at, id",
            ENTITLEMENT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entitlements)
    }

    async fn expired_grace_tenants(&self, now: OffsetDateTime) -> BillingResult<Vec<TenantId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT tenant_id
            FROM tenants
            WHERE status = 'grace' AND grace_until < $1
            ORDER BY grace_until
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| TenantId(id)).collect())
    }

    async fn count_ledger_entries(&self) -> BillingResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM billing_webhook_ledger")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn prune_ledger(&self, before: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM billing_webhook_ledger WHERE received_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn audit_log_for_tenant(&self, tenant_id: TenantId) -> BillingResult<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_audit_log WHERE tenant_id = $1 ORDER BY created_at, id",
            AUDIT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}
