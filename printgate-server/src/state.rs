//! Shared server state

use std::sync::Arc;
use std::time::Duration;

use printgate_core::{BroadcastScheduler, PrinterClient};

/// Shared application state
pub struct AppState {
    /// Repetier Server client (shares one upstream session)
    pub client: PrinterClient,

    /// Per-connection observer poll loops
    pub scheduler: BroadcastScheduler,

    /// Origin allowed to open observer connections ("*" allows any)
    pub allowed_origin: String,
}

impl AppState {
    pub fn new(client: PrinterClient, poll_interval: Duration, allowed_origin: String) -> Self {
        let scheduler = BroadcastScheduler::new(Arc::new(client.clone()), poll_interval);

        Self {
            client,
            scheduler,
            allowed_origin,
        }
    }

    /// Whether an observer from `origin` may connect
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origin == "*" || self.allowed_origin.trim_end_matches('/') == origin.trim_end_matches('/')
    }
}
