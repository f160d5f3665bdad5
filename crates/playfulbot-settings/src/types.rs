//! Settings tree. Serialized as camelCase JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotSettings {
    pub backend: BackendSettings,
    pub connection: ConnectionSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

impl BotSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.backend.endpoint.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "backend.endpoint must not be empty".into(),
            ));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "connection.connectTimeoutMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Directory service location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// `host:port` of the backend.
    pub endpoint: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            endpoint: "playfulbot.com:5000".to_string(),
        }
    }
}

/// Connection establishment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Deadline for a connection to become ready.
    pub connect_timeout_ms: u64,
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
        }
    }
}

/// Per-game session behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Version gaps tolerated in a row, with no patch applied in between,
    /// before the session fails.
    pub max_resync_requests: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_resync_requests: 3,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
