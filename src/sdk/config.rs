use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.anam.ai";
pub const DEFAULT_API_VERSION: &str = "/v1";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 100;

/// Options recognized for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_seconds: u64,
    /// Linear backoff unit: the n-th reconnect waits `n × base`.
    pub reconnect_base_delay_ms: u64,
    pub disable_input_audio: bool,
    pub start_muted: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            disable_input_audio: false,
            start_muted: false,
        }
    }
}

impl SessionOptions {
    /// # Errors
    /// Returns an error if the heartbeat interval is zero.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "heartbeatIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub const fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Apply the reconnection policy handed out by session bootstrap.
    #[must_use]
    pub fn with_server_policy(mut self, policy: &ReconnectPolicyParams) -> Self {
        if let Some(seconds) = policy.heartbeat_interval_seconds.filter(|s| *s > 0) {
            self.heartbeat_interval_seconds = seconds;
        }
        if let Some(attempts) = policy.max_ws_reconnection_attempts {
            self.max_reconnect_attempts = attempts;
        }
        self
    }
}

/// Reconnection parameters optionally supplied by the bootstrap response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ws_reconnection_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client: String,
    pub version: String,
}

/// Shared settings for everything that talks to the session API.
///
/// Pass one explicitly to each client you construct. `ClientContext::default()`
/// is the process-wide default and should only be used at the composition root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub api_base_url: String,
    pub api_version: String,
    pub metadata: ClientMetadata,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            metadata: ClientMetadata {
                client: "rust-sdk".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

impl ClientContext {
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.api_base_url.trim_end_matches('/'),
            self.api_version,
            path
        )
    }
}
