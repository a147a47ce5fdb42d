//! Chain settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ChainSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `CHAINLOOM_*` environment variable overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;
pub const DEFAULT_MAX_RUNS: u32 = 25;
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Limits and timeouts governing a chain run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSettings {
    /// Consecutive failures tolerated before a run gives up.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Upper bound on loop iterations for the looping run modes.
    #[serde(default = "default_max_runs")]
    pub max_runs: u32,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Backoff for retrying a single model before falling back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRY_COUNT
}
fn default_max_runs() -> u32 {
    DEFAULT_MAX_RUNS
}
fn default_tool_timeout_ms() -> u64 {
    DEFAULT_TOOL_TIMEOUT_MS
}
fn default_log_level() -> String {
    "info".into()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            max_runs: DEFAULT_MAX_RUNS,
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            retry: RetrySettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl ChainSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Reject combinations the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_count == 0 {
            return Err(SettingsError::InvalidValue("maxRetryCount must be at least 1".into()));
        }
        if self.max_runs == 0 {
            return Err(SettingsError::InvalidValue("maxRuns must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "retry.jitterFactor {} outside 0..=1",
                self.retry.jitter_factor
            )));
        }
        Ok(())
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ChainSettings> {
    let defaults = serde_json::to_value(ChainSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading chain settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ChainSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Invalid values are ignored and fall back to file/default.
pub fn apply_env_overrides(settings: &mut ChainSettings) {
    apply_overrides_from(settings, |key| std::env::var(key).ok());
}

fn apply_overrides_from(settings: &mut ChainSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAINLOOM_MAX_RETRY_COUNT").and_then(|v| parse_u64_range(&v, 1, 1_000)) {
        settings.max_retry_count = v as u32;
    }
    if let Some(v) = lookup("CHAINLOOM_MAX_RUNS").and_then(|v| parse_u64_range(&v, 1, 10_000)) {
        settings.max_runs = v as u32;
    }
    if let Some(v) = lookup("CHAINLOOM_TOOL_TIMEOUT_MS").and_then(|v| parse_u64_range(&v, 1, 3_600_000)) {
        settings.tool_timeout_ms = v;
    }
    if let Some(v) = lookup("CHAINLOOM_LOG_LEVEL") {
        let v = v.trim().to_lowercase();
        if matches!(v.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            settings.log_level = v;
        }
    }
}

fn parse_u64_range(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|v| (min..=max).contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = ChainSettings::default();
        assert_eq!(s.max_retry_count, 3);
        assert_eq!(s.max_runs, 25);
        assert_eq!(s.tool_timeout(), Duration::from_secs(120));
        assert_eq!(s.retry.base_delay(), Duration::from_secs(1));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serde_uses_camel_case_and_defaults() {
        let s: ChainSettings = serde_json::from_value(json!({"maxRetryCount": 5})).unwrap();
        assert_eq!(s.max_retry_count, 5);
        assert_eq!(s.max_runs, DEFAULT_MAX_RUNS);
        assert_eq!(s.retry, RetrySettings::default());
    }

    #[test]
    fn deep_merge_objects_recursively() {
        let merged = deep_merge(
            json!({"a": 1, "nested": {"x": 1, "y": 2}}),
            json!({"nested": {"y": 3}, "b": 2}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn deep_merge_skips_null_and_replaces_arrays() {
        let merged = deep_merge(json!({"a": 1, "list": [1, 2]}), json!({"a": null, "list": [3]}));
        assert_eq!(merged, json!({"a": 1, "list": [3]}));
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.max_retry_count, ChainSettings::default().max_retry_count);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"maxRuns": 7, "retry": {"maxRetries": 1}}"#).unwrap();
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.max_runs, 7);
        assert_eq!(s.retry.max_retries, 1);
        assert_eq!(s.retry.max_delay_ms, DEFAULT_MAX_DELAY_MS);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"retry": {"jitterFactor": 3.0}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_overrides_apply_within_range() {
        let mut s = ChainSettings::default();
        apply_overrides_from(
            &mut s,
            lookup(&[
                ("CHAINLOOM_MAX_RETRY_COUNT", "9"),
                ("CHAINLOOM_TOOL_TIMEOUT_MS", "500"),
                ("CHAINLOOM_LOG_LEVEL", "DEBUG"),
            ]),
        );
        assert_eq!(s.max_retry_count, 9);
        assert_eq!(s.tool_timeout_ms, 500);
        assert_eq!(s.log_level, "debug");
    }

    #[test]
    fn env_overrides_ignore_invalid() {
        let mut s = ChainSettings::default();
        apply_overrides_from(
            &mut s,
            lookup(&[
                ("CHAINLOOM_MAX_RETRY_COUNT", "0"),
                ("CHAINLOOM_MAX_RUNS", "lots"),
                ("CHAINLOOM_LOG_LEVEL", "loud"),
            ]),
        );
        assert_eq!(s, ChainSettings::default());
    }
}
