//! Test utilities and common setup.

use std::sync::Arc;

use axum::Router;
use vestry::api::{self, AppState};
use vestry::hub::PushHub;
use vestry::settings::Settings;

/// Publish credential used by the test applications.
pub const TEST_TOKEN: &str = "test-publish-token";

/// Settings for tests: fixed publish token, defaults elsewhere.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.publish_token = Some(TEST_TOKEN.to_string());
    settings
}

/// Create a test application backed by a fresh hub.
///
/// The hub is returned alongside the router so tests can open channels
/// and publish without going through HTTP.
pub fn test_app() -> (Router, Arc<PushHub>) {
    test_app_with_settings(test_settings())
}

/// Create a test application with custom settings.
pub fn test_app_with_settings(settings: Settings) -> (Router, Arc<PushHub>) {
    let hub = Arc::new(PushHub::new(settings.hub_config()));
    let state = AppState::new(hub.clone(), settings);
    (api::create_router(state), hub)
}
