//! Configuration for the stepflow observability subsystem.
//!
//! A [`MonitorConfig`] is loaded from a JSON file (every field optional) and
//! then adjusted from `STEPFLOW_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `STEPFLOW_TRACE_MAX_AGE_MS` | `max_trace_age_ms` |
//! | `STEPFLOW_CLEANUP_INTERVAL_MS` | `cleanup_interval_ms` |
//! | `STEPFLOW_EVICT_ON_INGEST` | `evict_on_ingest` |
//! | `STEPFLOW_SEARCH_LIMIT` | `default_search_limit` |
//! | `STEPFLOW_NOTIFY_CAPACITY` | `notify_capacity` |
//! | `STEPFLOW_STORE_PATH` | `store` (switches to SQLite) |

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Traces older than a day are evicted.
pub const DEFAULT_MAX_TRACE_AGE_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60 * 1000;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

fn default_max_trace_age_ms() -> u64 {
    DEFAULT_MAX_TRACE_AGE_MS
}

fn default_cleanup_interval_ms() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}

fn default_search_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

fn default_notify_capacity() -> usize {
    DEFAULT_NOTIFY_CAPACITY
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Structs
// ─────────────────────────────────────────────────────────────────────────────

/// Where traces and groups are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local map, lost on exit.
    #[default]
    Memory,
    /// SQLite database file.
    Sqlite { path: PathBuf },
}

/// Settings for trace assembly, eviction and search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Traces whose start time is older than this are evicted.
    #[serde(default = "default_max_trace_age_ms")]
    pub max_trace_age_ms: u64,
    /// Period of the background eviction task.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Run an eviction scan after every ingested event.
    #[serde(default)]
    pub evict_on_ingest: bool,
    /// Result limit used when a search filter does not set one.
    #[serde(default = "default_search_limit")]
    pub default_search_limit: usize,
    /// Buffer size of the notification broadcast channel.
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_trace_age_ms: DEFAULT_MAX_TRACE_AGE_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            evict_on_ingest: false,
            default_search_limit: DEFAULT_SEARCH_LIMIT,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            store: StoreConfig::Memory,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_trace_age_ms(mut self, ms: u64) -> Self {
        self.max_trace_age_ms = ms;
        self
    }

    pub fn with_cleanup_interval_ms(mut self, ms: u64) -> Self {
        self.cleanup_interval_ms = ms;
        self
    }

    pub fn with_evict_on_ingest(mut self, enabled: bool) -> Self {
        self.evict_on_ingest = enabled;
        self
    }

    pub fn with_default_search_limit(mut self, limit: usize) -> Self {
        self.default_search_limit = limit;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Applies `STEPFLOW_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STEPFLOW_TRACE_MAX_AGE_MS") {
            self.max_trace_age_ms = parse_value("STEPFLOW_TRACE_MAX_AGE_MS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_CLEANUP_INTERVAL_MS") {
            self.cleanup_interval_ms = parse_value("STEPFLOW_CLEANUP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_EVICT_ON_INGEST") {
            self.evict_on_ingest = parse_value("STEPFLOW_EVICT_ON_INGEST", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_SEARCH_LIMIT") {
            self.default_search_limit = parse_value("STEPFLOW_SEARCH_LIMIT", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_NOTIFY_CAPACITY") {
            self.notify_capacity = parse_value("STEPFLOW_NOTIFY_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("STEPFLOW_STORE_PATH") {
            self.store = StoreConfig::Sqlite { path: PathBuf::from(v) };
        }
        Ok(self)
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::new();
        assert_eq!(config.max_trace_age_ms, 86_400_000);
        assert_eq!(config.default_search_limit, 20);
        assert!(!config.evict_on_ingest);
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_trace_age_ms": 1000, "store": {{"backend": "sqlite", "path": "/tmp/traces.db"}}}}"#
        )
        .unwrap();

        let config = MonitorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_trace_age_ms, 1000);
        assert_eq!(config.cleanup_interval_ms, DEFAULT_CLEANUP_INTERVAL_MS);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/tmp/traces.db")
            }
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("STEPFLOW_TRACE_MAX_AGE_MS", "5000"),
            ("STEPFLOW_EVICT_ON_INGEST", "true"),
            ("STEPFLOW_STORE_PATH", "traces.db"),
        ]);

        let config = MonitorConfig::new()
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.max_trace_age_ms, 5000);
        assert!(config.evict_on_ingest);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("traces.db")
            }
        );
    }

    #[test]
    fn test_invalid_override() {
        let err = MonitorConfig::new()
            .apply_overrides(|k| (k == "STEPFLOW_SEARCH_LIMIT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "STEPFLOW_SEARCH_LIMIT", .. }));
    }
}
