//! Application state

use std::sync::Arc;

use shiftdesk_billing::BillingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }
}
