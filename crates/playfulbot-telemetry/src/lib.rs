//! Tracing subscriber setup for processes embedding the engine.

use playfulbot_settings::LoggingSettings;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "playfulbot_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl From<&LoggingSettings> for TelemetryConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            log_level: settings.level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json: settings.json,
        }
    }
}

impl TelemetryConfig {
    /// `EnvFilter` directives for this config, e.g. `info,playfulbot_engine=debug`.
    pub fn directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Install the global subscriber. Call once at startup; a second call fails.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let (json_layer, text_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        )
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("playfulbot_engine".into(), Level::DEBUG)],
            json: false,
        };
        assert_eq!(config.directives(), "warn,playfulbot_engine=debug");
    }

    #[test]
    fn from_settings_parses_level() {
        let settings = LoggingSettings {
            level: "debug".into(),
            json: true,
        };
        let config = TelemetryConfig::from(&settings);
        assert_eq!(config.log_level, Level::DEBUG);
        assert!(config.json);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let settings = LoggingSettings {
            level: "chatty".into(),
            json: false,
        };
        assert_eq!(TelemetryConfig::from(&settings).log_level, Level::INFO);
    }

    #[test]
    fn second_install_fails() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        let second = init_telemetry(&config);
        assert!(matches!(second, Err(TelemetryError::Init(_))));
    }
}
