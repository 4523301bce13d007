//! Billing configuration loaded from the environment

use time::Duration;

use crate::error::{BillingError, BillingResult};

/// Grace window applied after a subscription ends
pub const DEFAULT_GRACE_WINDOW_DAYS: i64 = 14;

/// Maximum clock skew accepted on signed webhook deliveries
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// How long ledger rows are kept for duplicate detection
pub const DEFAULT_LEDGER_RETENTION_DAYS: i64 = 30;

/// Upper bound for any day-valued setting
pub const MAX_DAYS: i64 = 3650;

/// Upper bound for the signature tolerance
pub const MAX_SIGNATURE_TOLERANCE_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret for the webhook envelope HMAC
    pub webhook_secret: String,
    pub signature_tolerance: Duration,
    pub grace_window: Duration,
    pub ledger_retention: Duration,
}

impl BillingConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            signature_tolerance: Duration::seconds(DEFAULT_SIGNATURE_TOLERANCE_SECS),
            grace_window: Duration::days(DEFAULT_GRACE_WINDOW_DAYS),
            ledger_retention: Duration::days(DEFAULT_LEDGER_RETENTION_DAYS),
        }
    }

    /// Load from `BILLING_*` environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET").map_err(|_| {
            BillingError::Config("BILLING_WEBHOOK_SECRET must be set".to_string())
        })?;
        if webhook_secret.is_empty() {
            return Err(BillingError::Config(
                "BILLING_WEBHOOK_SECRET must not be empty".to_string(),
            ));
        }
        Self::load(webhook_secret)
    }

    /// Same as [`BillingConfig::from_env`] for processes that never verify webhooks
    pub fn from_env_without_secret() -> BillingResult<Self> {
        Self::load(String::new())
    }

    fn load(webhook_secret: String) -> BillingResult<Self> {
        let tolerance_secs = env_i64(
            "BILLING_SIGNATURE_TOLERANCE_SECS",
            DEFAULT_SIGNATURE_TOLERANCE_SECS,
            MAX_SIGNATURE_TOLERANCE_SECS,
        )?;
        let grace_days = env_i64(
            "BILLING_GRACE_WINDOW_DAYS",
            DEFAULT_GRACE_WINDOW_DAYS,
            MAX_DAYS,
        )?;
        let retention_days = env_i64(
            "BILLING_LEDGER_RETENTION_DAYS",
            DEFAULT_LEDGER_RETENTION_DAYS,
            MAX_DAYS,
        )?;

        Ok(Self {
            webhook_secret,
            signature_tolerance: Duration::seconds(tolerance_secs),
            grace_window: Duration::days(grace_days),
            ledger_retention: Duration::days(retention_days),
        })
    }

    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }
}

fn env_i64(name: &str, default: i64, max: i64) -> BillingResult<i64> {
    match std::env::var(name) {
        Ok(raw) => parse_bounded(name, &raw, max),
        Err(_) => Ok(default),
    }
}

fn parse_bounded(name: &str, raw: &str, max: i64) -> BillingResult<i64> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| BillingError::Config(format!("{} must be an integer", name)))?;
    if value <= 0 {
        return Err(BillingError::Config(format!("{} must be positive", name)));
    }
    if value > max {
        return Err(BillingError::Config(format!(
            "{} must be at most {}",
            name, max
        )));
    }
    Ok(value)
}
