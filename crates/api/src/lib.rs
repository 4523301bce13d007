// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ShiftDesk API Library
//!
//! HTTP surface of the billing reconciliation core: the signed processor webhook and
//! the tenant access query.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
