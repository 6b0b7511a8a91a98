//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was out of range.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Logging options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "compact".into(),
        }
    }
}

/// Everything a host process reads at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Listener and transport options.
    pub server: ServerConfig,
    /// Logging options.
    pub logging: LoggingConfig,
}

impl Settings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue("server.max_connections must be at least 1".into()));
        }
        if self.server.send_buffer == 0 {
            return Err(SettingsError::InvalidValue("server.send_buffer must be at least 1".into()));
        }
        if self.server.rpc.call_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("server.rpc.call_timeout_ms must be at least 1".into()));
        }
        Ok(())
    }
}

/// Resolve the default settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from `path` (or the default path) with env var overrides.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, SettingsError> {
    let default_path;
    let path = match path {
        Some(path) => path,
        None => {
            default_path = settings_path();
            &default_path
        }
    };
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, reading overrides through `env`.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_with<F>(path: &Path, env: F) -> Result<Settings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply `TETHER_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut Settings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("TETHER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("TETHER_PORT").and_then(|v| parse_in_range("TETHER_PORT", &v, 0, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = read("TETHER_MAX_CONNECTIONS")
        .and_then(|v| parse_in_range("TETHER_MAX_CONNECTIONS", &v, 1, 100_000))
    {
        settings.server.max_connections = v;
    }
    if let Some(v) = read("TETHER_CALL_TIMEOUT_MS")
        .and_then(|v| parse_in_range("TETHER_CALL_TIMEOUT_MS", &v, 1, 3_600_000))
    {
        settings.server.rpc.call_timeout_ms = v;
    }
    if let Some(v) = read("TETHER_POLL_INTERVAL_MS")
        .and_then(|v| parse_in_range("TETHER_POLL_INTERVAL_MS", &v, 1, 60_000))
    {
        settings.server.rpc.poll_interval_ms = v;
    }
    if let Some(v) = read("TETHER_LOG") {
        settings.logging.level = v;
    }
    if let Some(v) = read("TETHER_LOG_FORMAT") {
        settings.logging.format = v;
    }
}

/// Parse `val` as a number within `[min, max]`.
pub fn parse_in_range<T>(name: &str, val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let parsed = val.parse::<T>().ok().filter(|n| *n >= min && *n <= max);
    if parsed.is_none() {
        warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use serde_json::json;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_with(&dir.path().join("settings.json"), no_env).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9400, "rpc": {"call_timeout_ms": 500}}, "logging": {"format": "json"}}"#,
        )
        .unwrap();

        let settings = load_settings_with(&path, no_env).unwrap();
        assert_eq!(settings.server.port, 9400);
        assert_eq!(settings.server.rpc.call_timeout_ms, 500);
        assert_eq!(settings.server.rpc.poll_interval_ms, 1_000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.logging.format, "json");
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_with(&path, no_env), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 9400}}"#).unwrap();

        let env = env_from(&[
            ("TETHER_PORT", "9500"),
            ("TETHER_HOST", "0.0.0.0"),
            ("TETHER_CALL_TIMEOUT_MS", "2500"),
            ("TETHER_LOG", "debug"),
        ]);
        let settings = load_settings_with(&path, env).unwrap();
        assert_eq!(settings.server.port, 9500);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.rpc.call_timeout_ms, 2500);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = Settings::default();
        apply_env_overrides(
            &mut settings,
            env_from(&[
                ("TETHER_PORT", "99999"),
                ("TETHER_MAX_CONNECTIONS", "0"),
                ("TETHER_POLL_INTERVAL_MS", "soon"),
                ("TETHER_HOST", ""),
            ]),
        );
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn zero_timeout_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"rpc": {"call_timeout_ms": 0}}}"#).unwrap();
        assert!(matches!(
            load_settings_with(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn deep_merge_rules() {
        let target = json!({"a": {"b": 1, "c": 2}, "list": [1, 2], "keep": true});
        let source = json!({"a": {"b": 10}, "list": [3], "keep": null, "new": "x"});
        assert_eq!(
            deep_merge(target, source),
            json!({"a": {"b": 10, "c": 2}, "list": [3], "keep": true, "new": "x"})
        );
    }

    #[test]
    fn parse_in_range_bounds() {
        assert_eq!(parse_in_range::<u64>("X", "5", 1, 10), Some(5));
        assert_eq!(parse_in_range::<u64>("X", "11", 1, 10), None);
        assert_eq!(parse_in_range::<u16>("X", "-1", 0, 10), None);
    }

    #[test]
    fn default_path_under_home() {
        assert!(settings_path().ends_with(".tether/settings.json"));
    }
}
