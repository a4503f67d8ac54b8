//! Sync configuration shared by every Harbor client.
//!
//! `SyncSettings` is read from a JSON file and can be overridden from the
//! environment. Text values are normalized on load; [`SyncSettings::validate`]
//! rejects anything the engine cannot run with.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::validate_table_name;
use crate::sync::{strategy_from_name, ConflictStrategy, RetryPolicy};
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

/// Environment variable overriding [`SyncSettings::remote_url`]
pub const ENV_REMOTE_URL: &str = "HARBOR_REMOTE_URL";
/// Environment variable overriding [`SyncSettings::api_key`]
pub const ENV_API_KEY: &str = "HARBOR_API_KEY";
/// Environment variable overriding [`SyncSettings::access_token`]
pub const ENV_ACCESS_TOKEN: &str = "HARBOR_ACCESS_TOKEN";

const DEFAULT_TABLES: &[&str] = &["tenants", "boats", "maintenance", "stock", "orders", "suppliers"];

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncSettings {
    /// Base URL of the PostgREST-compatible backend
    #[serde(default)]
    pub remote_url: Option<String>,
    /// Public API key sent as `apikey`
    #[serde(default)]
    pub api_key: Option<String>,
    /// User access token; falls back to the API key when absent
    #[serde(default)]
    pub access_token: Option<String>,
    /// Local database file; the platform data dir is used when absent
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_reconnect_debounce_ms")]
    pub reconnect_debounce_ms: u64,
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: String,
    #[serde(default = "default_background_interval_secs")]
    pub background_interval_secs: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_url: None,
            api_key: None,
            access_token: None,
            database_path: None,
            tables: default_tables(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetrySettings::default(),
            reconnect_debounce_ms: default_reconnect_debounce_ms(),
            conflict_strategy: default_conflict_strategy(),
            background_interval_secs: default_background_interval_secs(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl std::fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("remote_url", &self.remote_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("database_path", &self.database_path)
            .field("tables", &self.tables)
            .field("page_size", &self.page_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("retry", &self.retry)
            .field("reconnect_debounce_ms", &self.reconnect_debounce_ms)
            .field("conflict_strategy", &self.conflict_strategy)
            .field("background_interval_secs", &self.background_interval_secs)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .finish()
    }
}

impl SyncSettings {
    /// Parse settings from JSON text.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut settings: Self = serde_json::from_str(raw)
            .map_err(|error| Error::Config(format!("invalid settings JSON: {error}")))?;
        settings.normalize();
        Ok(settings)
    }

    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(|error| match error {
            Error::Config(message) => Error::Config(format!("{}: {message}", path.display())),
            other => other,
        })
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut normalized = self.clone();
        normalized.normalize();
        std::fs::write(path, serde_json::to_string_pretty(&normalized)?)?;
        Ok(())
    }

    /// Override connection values from `lookup` (usually `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = normalize_text_option(lookup(ENV_REMOTE_URL)) {
            self.remote_url = Some(url);
        }
        if let Some(key) = normalize_text_option(lookup(ENV_API_KEY)) {
            self.api_key = Some(key);
        }
        if let Some(token) = normalize_text_option(lookup(ENV_ACCESS_TOKEN)) {
            self.access_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.remote_url {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "remote_url must include http:// or https://".to_string(),
                ));
            }
        }
        if self.tables.is_empty() {
            return Err(Error::Config("at least one table must be tracked".to_string()));
        }
        for (index, table) in self.tables.iter().enumerate() {
            validate_table_name(table)
                .map_err(|error| Error::Config(format!("tables[{index}]: {error}")))?;
            if self.tables[..index].contains(table) {
                return Err(Error::Config(format!("table '{table}' is listed twice")));
            }
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be positive".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
            ));
        }
        strategy_from_name(&self.conflict_strategy)?;
        Ok(())
    }

    /// Whether enough is configured to reach a backend.
    pub const fn has_remote(&self) -> bool {
        self.remote_url.is_some() && self.api_key.is_some()
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn conflict_strategy(&self) -> Result<Arc<dyn ConflictStrategy>> {
        strategy_from_name(&self.conflict_strategy)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub const fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub const fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs)
    }

    pub const fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    fn normalize(&mut self) {
        self.remote_url =
            normalize_text_option(self.remote_url.take()).map(|url| url.trim_end_matches('/').to_string());
        self.api_key = normalize_text_option(self.api_key.take());
        self.access_token = normalize_text_option(self.access_token.take());
        self.database_path = normalize_text_option(self.database_path.take());
        self.tables = self
            .tables
            .iter()
            .filter_map(|table| normalize_text_option(Some(table.to_lowercase())))
            .collect();
        self.conflict_strategy = self.conflict_strategy.trim().to_lowercase();
    }
}

fn default_tables() -> Vec<String> {
    DEFAULT_TABLES.iter().map(|table| (*table).to_string()).collect()
}

const fn default_page_size() -> usize {
    500
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    5_000
}

const fn default_max_delay_ms() -> u64 {
    300_000
}

const fn default_reconnect_debounce_ms() -> u64 {
    2_000
}

fn default_conflict_strategy() -> String {
    "remote_wins".to_string()
}

const fn default_background_interval_secs() -> u64 {
    15 * 60
}

const fn default_probe_interval_secs() -> u64 {
    30
}
