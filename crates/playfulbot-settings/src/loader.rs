//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::BotSettings;

/// Resolve the path to the settings file (`~/.playfulbot/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".playfulbot").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BotSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON or an invalid final value is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<BotSettings> {
    load_with(path, |name| std::env::var(name).ok())
}

fn load_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<BotSettings> {
    let defaults = serde_json::to_value(BotSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BotSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PLAYFULBOT_*` environment overrides.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(settings: &mut BotSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut BotSettings, env: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PLAYFULBOT_BACKEND_ENDPOINT") {
        settings.backend.endpoint = v;
    }
    if let Some(v) = read("PLAYFULBOT_CONNECT_TIMEOUT_MS") {
        if let Some(n) = checked("PLAYFULBOT_CONNECT_TIMEOUT_MS", &v, parse_u64_range(&v, 1, 600_000)) {
            settings.connection.connect_timeout_ms = n;
        }
    }
    if let Some(v) = read("PLAYFULBOT_MAX_RESYNC_REQUESTS") {
        if let Some(n) = checked("PLAYFULBOT_MAX_RESYNC_REQUESTS", &v, parse_u64_range(&v, 0, 1_000)) {
            settings.session.max_resync_requests = n as u32;
        }
    }
    if let Some(v) = read("PLAYFULBOT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("PLAYFULBOT_LOG_JSON") {
        if let Some(b) = checked("PLAYFULBOT_LOG_JSON", &v, parse_bool(&v)) {
            settings.logging.json = b;
        }
    }
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
