//! ShiftDesk Billing Worker
//!
//! Handles scheduled jobs including:
//! - Grace-expiry sweep (hourly)
//! - Webhook ledger retention prune (daily at 3:00 AM UTC)
//! - Billing invariant report (daily at 4:00 AM UTC)
//!
//! `--once` runs a single sweep and exits, for deployments that schedule externally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shiftdesk_api::telemetry;
use shiftdesk_billing::{
    store::postgres::{connect, run_migrations},
    BillingConfig, BillingStore, GraceExpirySweep, InvariantChecker, PgBillingStore, SweepReport,
};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const MAX_CONNECTIONS: u32 = 5;

/// Log results of a sweep run
fn log_sweep_report(report: &SweepReport) {
    info!(
        candidates = report.candidates,
        transitioned = report.transitioned,
        failures = report.failures.len(),
        "Grace-expiry sweep cycle complete"
    );

    for failure in &report.failures {
        error!(
            tenant_id = %failure.tenant_id,
            error = %failure.error,
            "Tenant left in grace, will retry next cycle"
        );
    }
}

async fn run_sweep(sweep: &GraceExpirySweep) {
    match sweep.sweep(OffsetDateTime::now_utc()).await {
        Ok(report) => log_sweep_report(&report),
        Err(e) => error!(error = %e, "Grace-expiry sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    telemetry::init_tracing("info");

    let once = std::env::args().skip(1).any(|arg| arg == "--once");

    info!("Starting ShiftDesk Billing Worker");

    let config = BillingConfig::from_env_without_secret()?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let pool = connect(&database_url, MAX_CONNECTIONS).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
    let sweep = GraceExpirySweep::new(store.clone());

    if once {
        info!("Running single grace-expiry sweep");
        let report = sweep.sweep(OffsetDateTime::now_utc()).await?;
        log_sweep_report(&report);
        return Ok(());
    }

    let scheduler = JobScheduler::new().await?;

    // Job 1: Grace-expiry sweep
    // Cron: At minute 0 of every hour
    let hourly_sweep = sweep.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let sweep = hourly_sweep.clone();
            Box::pin(async move {
                info!("Running scheduled grace-expiry sweep");
                run_sweep(&sweep).await;
            })
        })?)
        .await?;
    info!("Scheduled: Grace-expiry sweep (hourly)");

    // Job 2: Prune ledger rows past the retention horizon
    let prune_store = store.clone();
    let retention = config.ledger_retention;
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let store = prune_store.clone();
            Box::pin(async move {
                info!("Running webhook ledger prune");
                let horizon = OffsetDateTime::now_utc() - retention;
                match store.prune_ledger(horizon).await {
                    Ok(deleted) => info!(deleted = deleted, "Webhook ledger prune complete"),
                    Err(e) => error!(error = %e, "Webhook ledger prune failed"),
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention.whole_days(),
        "Scheduled: Webhook ledger prune (daily at 3:00 AM UTC)"
    );

    // Job 3: Invariant report
    let checker = Arc::new(InvariantChecker::new(store.clone()));
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let summary = match checker.run_all_checks(OffsetDateTime::now_utc()).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        error!(error = %e, "Billing invariant checks failed to run");
                        return;
                    }
                };

                for violation in &summary.violations {
                    warn!(
                        invariant = %violation.invariant,
                        severity = %violation.severity,
                        tenant_ids = ?violation.tenant_ids,
                        context = %violation.context,
                        "{}",
                        violation.description
                    );
                }

                info!(
                    tenants_checked = summary.tenants_checked,
                    checks_passed = summary.checks_passed,
                    checks_failed = summary.checks_failed,
                    healthy = summary.healthy,
                    "Billing invariant report complete"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant report (daily at 4:00 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!(
        "ShiftDesk Billing Worker started successfully with {} scheduled jobs",
        3
    );

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
