#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ShiftDesk API Server
//!
//! Receives signed billing webhooks and answers tenant access queries.

use std::sync::Arc;

use anyhow::Context;
use shiftdesk_api::{config::Config, routes::create_router, telemetry, AppState};
use shiftdesk_billing::{
    store::postgres::{connect, run_migrations},
    BillingService, BillingStore, PgBillingStore,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    telemetry::init_tracing("info,shiftdesk_api=debug,shiftdesk_billing=debug");

    tracing::info!("Starting ShiftDesk API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(
        grace_window_days = config.billing.grace_window.whole_days(),
        signature_tolerance_secs = config.billing.signature_tolerance.whole_seconds(),
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = connect(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
    let billing = Arc::new(BillingService::new(config.billing.clone(), store));
    let state = AppState::new(billing);

    let app = create_router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
