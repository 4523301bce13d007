//! API server configuration

use anyhow::Context;
use shiftdesk_billing::BillingConfig;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
        let database_max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?,
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };
        let billing = BillingConfig::from_env()?;

        Ok(Self {
            bind_address,
            database_url,
            database_max_connections,
            billing,
        })
    }
}
