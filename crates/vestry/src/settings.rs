//! Server configuration loaded from defaults, a TOML file, and environment
//! overrides.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::{DEFAULT_CHANNEL_BUFFER, DEFAULT_HEARTBEAT_SECS, HubConfig};

/// Configuration failures, surfaced synchronously to the caller at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error(
        "auth.publish_token is required; set it in the config file or VESTRY_AUTH__PUBLISH_TOKEN"
    )]
    MissingPublishToken,
}

/// Resolved application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub hub: HubSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address the HTTP server binds to.
    pub listen: String,
    /// Origins allowed to call the API cross-origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Seconds between heartbeat comment frames on idle streams.
    pub heartbeat_secs: u64,
    /// Per-channel send buffer; a channel this far behind misses events.
    pub channel_buffer: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Bearer token mutation handlers present when publishing.
    pub publish_token: Option<String>,
}

impl Settings {
    /// Load settings: defaults, then the optional TOML file, then
    /// `VESTRY_*` environment overrides (e.g. `VESTRY_SERVER__LISTEN`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("VESTRY").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Check invariants that have no sensible default. The publish token
    /// is an external credential; starting without it would leave the
    /// publish endpoint open.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.auth.publish_token.as_deref() {
            Some(token) if !token.is_empty() => Ok(()),
            _ => Err(ConfigError::MissingPublishToken),
        }
    }

    /// Hub tuning derived from these settings.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_buffer: self.hub.channel_buffer,
            heartbeat: Duration::from_secs(self.hub.heartbeat_secs),
        }
    }
}
