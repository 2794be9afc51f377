//! Configuration for the voice SDK.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Voice gateway protocol version appended to the endpoint URL.
pub const DEFAULT_GATEWAY_VERSION: u8 = 4;

/// How long `connect` waits for both handshake fragments.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// How long a closing connection waits for the server's close frame.
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_RECONNECT_INITIAL_BACKOFF_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_BACKOFF_MS: u64 = 30_000;

pub const DEFAULT_ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// Voice states kept per user; the oldest is dropped first.
pub const DEFAULT_STATE_HISTORY_LEN: usize = 2;

/// Capacity of the broadcast channel for client events.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub gateway_version: u8,
    pub handshake_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Preferred encryption modes, best first.
    pub encryption_modes: Vec<String>,
    pub state_history_len: usize,
    pub event_channel_capacity: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            gateway_version: DEFAULT_GATEWAY_VERSION,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            reconnect_initial_backoff_ms: DEFAULT_RECONNECT_INITIAL_BACKOFF_MS,
            reconnect_max_backoff_ms: DEFAULT_RECONNECT_MAX_BACKOFF_MS,
            max_reconnect_attempts: None,
            encryption_modes: vec![DEFAULT_ENCRYPTION_MODE.to_string()],
            state_history_len: DEFAULT_STATE_HISTORY_LEN,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl VoiceConfig {
    /// Load from a TOML file, then apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, VoiceError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| VoiceError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config = Self::from_toml_str(&contents)?.with_env_overrides();
        tracing::debug!("Loaded voice config from {:?}", path);
        Ok(config)
    }

    /// Parse from TOML text.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this config.
    pub fn from_toml_str(contents: &str) -> Result<Self, VoiceError> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| VoiceError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `VOICEGATE_HANDSHAKE_TIMEOUT_MS` and `VOICEGATE_GATEWAY_VERSION` if set.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse("VOICEGATE_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = ms;
        }
        if let Some(version) = env_parse("VOICEGATE_GATEWAY_VERSION") {
            self.gateway_version = version;
        }
        self
    }

    fn validate(&self) -> Result<(), VoiceError> {
        if self.encryption_modes.is_empty() {
            return Err(VoiceError::Config(
                "encryption_modes must list at least one mode".to_string(),
            ));
        }
        if self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms {
            return Err(VoiceError::Config(
                "reconnect_initial_backoff_ms exceeds reconnect_max_backoff_ms".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(VoiceError::Config(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    #[must_use]
    pub fn reconnect_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_backoff_ms)
    }

    #[must_use]
    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }

    /// Voice socket URL for an endpoint, e.g. `wss://host?v=4`.
    #[must_use]
    pub fn gateway_url(&self, endpoint: &str) -> String {
        let host = endpoint
            .trim_start_matches("wss://")
            .trim_end_matches('/');
        format!("wss://{}?v={}", host, self.gateway_version)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
