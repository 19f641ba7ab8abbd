// ABOUTME: Session configuration loading and defaults.
// ABOUTME: Supports TOML config files; every field has a sensible default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelConfig, KeepAliveConfig};
use crate::error::SessionError;

/// Default time to wait for a response to a sent message.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for one [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Channel this agent sends and receives on.
    pub channel_id: String,
    /// Connect to the regional endpoint instead of the zonal one.
    pub regional: bool,
    /// Milliseconds to wait for each message response
    pub response_timeout_ms: u64,
    /// Endpoint override (e.g., "http://localhost:8080")
    pub endpoint: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// HTTP/2 keep-alive settings
    pub keep_alive: KeepAliveSettings,
    /// Metadata server host override
    pub metadata_host: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            regional: false,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            endpoint: None,
            connect_timeout_secs: 30,
            keep_alive: KeepAliveSettings::default(),
            metadata_host: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub while_idle: bool,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        let ka = KeepAliveConfig::default();
        Self {
            interval_secs: ka.interval.as_secs(),
            timeout_secs: ka.timeout.as_secs(),
            while_idle: ka.while_idle,
        }
    }
}

impl From<&KeepAliveSettings> for KeepAliveConfig {
    fn from(settings: &KeepAliveSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            timeout: Duration::from_secs(settings.timeout_secs),
            while_idle: settings.while_idle,
        }
    }
}

impl SessionConfig {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self, SessionError> {
        toml::from_str(content).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn with_regional(mut self, regional: bool) -> Self {
        self.regional = regional;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.channel_id.trim().is_empty() {
            return Err(SessionError::Config("channel_id is required".to_string()));
        }
        if self.response_timeout_ms == 0 {
            return Err(SessionError::Config(
                "response_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Service endpoint for a zone or region.
    pub fn endpoint_for(&self, location: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://{}-agentcommunication.googleapis.com:443", location),
        }
    }

    /// Channel settings for a zone or region.
    pub fn channel_config(&self, location: &str) -> ChannelConfig {
        ChannelConfig::new(self.endpoint_for(location))
            .with_keep_alive((&self.keep_alive).into())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }
}
