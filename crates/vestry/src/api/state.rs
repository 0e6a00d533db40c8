//! Application state shared across handlers.

use std::sync::Arc;

use crate::hub::PushHub;
use crate::settings::Settings;

/// Shared handler state: the hub and the resolved settings.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<PushHub>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(hub: Arc<PushHub>, settings: Settings) -> Self {
        Self {
            hub,
            settings: Arc::new(settings),
        }
    }
}
