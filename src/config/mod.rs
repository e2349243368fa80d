// src/config/mod.rs
//! Process-wide settings, loaded once from a TOML file.
//!
//! Lookup order for the file:
//! 1) explicit path (CLI `--config`)
//! 2) `$MOODLE_COURIER_CONFIG`
//! 3) `config/courier.toml`
//!
//! Any string value written as `env:NAME` is replaced by the value of the
//! environment variable `NAME` before deserialization.

pub mod ai;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::filter::FilterRules;
use crate::logging::LogFormat;
use crate::state::CorruptStatePolicy;

pub use ai::AiConfig;

pub const ENV_CONFIG_PATH: &str = "MOODLE_COURIER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/courier.toml";

const ENV_PREFIX: &str = "env:";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub moodle: MoodleSettings,
    #[serde(default)]
    pub notification: NotificationSettings,
    #[serde(default)]
    pub state: StateSettings,
    #[serde(default)]
    pub filters: FilterRules,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// `[providers.<name>]` sections, keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
}

fn default_initial_fetch_count() -> usize {
    1
}
fn default_session_file() -> PathBuf {
    PathBuf::from("state/session.json")
}
fn default_session_refresh_hours() -> u64 {
    24
}

#[derive(Clone, Deserialize)]
pub struct MoodleSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    /// How many of the newest notifications to deliver on the very first run.
    #[serde(default = "default_initial_fetch_count")]
    pub initial_fetch_count: usize,
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    /// Secret used to encrypt the session cache. Without it the cache is disabled.
    #[serde(default)]
    pub session_encryption_key: Option<String>,
    #[serde(default = "default_session_refresh_hours")]
    pub session_refresh_hours: u64,
}

impl std::fmt::Debug for MoodleSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoodleSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("initial_fetch_count", &self.initial_fetch_count)
            .field("session_file", &self.session_file)
            .field(
                "session_encryption",
                &self.session_encryption_key.is_some(),
            )
            .field("session_refresh_hours", &self.session_refresh_hours)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub fetch_interval_secs: u64,
    /// Maximum notifications requested per fetch.
    pub fetch_limit: u32,
    pub max_payload_bytes: usize,
    pub provider_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Transport-level retries for a single Moodle request.
    pub retry_total: u32,
    pub retry_backoff_ms: u64,
    pub error_backoff_base_secs: u64,
    pub error_backoff_max_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            fetch_interval_secs: 60,
            fetch_limit: 20,
            max_payload_bytes: 65_536,
            provider_timeout_secs: 15,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            retry_total: 3,
            retry_backoff_ms: 500,
            error_backoff_base_secs: 30,
            error_backoff_max_secs: 300,
        }
    }
}

impl NotificationSettings {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Wait before the next cycle after `consecutive_failures` failed cycles in a row.
    pub fn backoff_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.fetch_interval();
        }
        let shift = (consecutive_failures - 1).min(16);
        let secs = self
            .error_backoff_base_secs
            .saturating_mul(1u64 << shift)
            .min(self.error_backoff_max_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub path: PathBuf,
    pub history_size: usize,
    pub on_corrupt: CorruptStatePolicy,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("state/state.json"),
            history_size: 50,
            on_corrupt: CorruptStatePolicy::Fail,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub heartbeat_interval_hours: Option<u64>,
    pub failure_alert_threshold: Option<u32>,
    /// Provider that receives heartbeats and failure alerts.
    pub target_provider: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:9095".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

/// One `[providers.<name>]` table: the `enabled` gate plus free-form parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl Settings {
    /// Resolve the config path (explicit > env > default) and load it.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => std::env::var(ENV_CONFIG_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path, |name| std::env::var(name).ok())
    }

    /// Parse, resolve `env:` references through `lookup`, then validate.
    ///
    /// `[providers.*]` is left untouched: those references are resolved per
    /// provider when the registry instantiates enabled sections.
    pub fn from_toml_str<F>(content: &str, origin: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_err = |reason: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            reason,
        };
        let mut table: toml::Table =
            toml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
        for (key, value) in table.iter_mut() {
            if key != "providers" {
                resolve_env_refs(value, key, &lookup)?;
            }
        }
        let mut settings: Settings = toml::Value::Table(table)
            .try_into()
            .map_err(|e| parse_err(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        let m = &mut self.moodle;
        m.url = m.url.trim().trim_end_matches('/').to_string();
        if !(m.url.starts_with("https://") || m.url.starts_with("http://")) {
            return Err(ConfigError::invalid(
                "moodle.url",
                "must start with http:// or https://",
            ));
        }
        if m.username.trim().is_empty() {
            return Err(ConfigError::invalid("moodle.username", "must not be empty"));
        }
        if m.password.is_empty() {
            return Err(ConfigError::invalid("moodle.password", "must not be empty"));
        }
        if m.session_encryption_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            m.session_encryption_key = None;
        }

        let n = &self.notification;
        if !(10..=3600).contains(&n.fetch_interval_secs) {
            return Err(ConfigError::invalid(
                "notification.fetch_interval_secs",
                "must be within 10..=3600",
            ));
        }
        if !(1024..=262_144).contains(&n.max_payload_bytes) {
            return Err(ConfigError::invalid(
                "notification.max_payload_bytes",
                "must be within 1024..=262144",
            ));
        }
        if n.retry_total > 10 {
            return Err(ConfigError::invalid(
                "notification.retry_total",
                "must be at most 10",
            ));
        }
        if n.fetch_limit == 0 {
            return Err(ConfigError::invalid(
                "notification.fetch_limit",
                "must be at least 1",
            ));
        }
        if n.provider_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "notification.provider_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.state.history_size == 0 {
            return Err(ConfigError::invalid(
                "state.history_size",
                "must be at least 1",
            ));
        }
        if let Some(0) = self.health.failure_alert_threshold {
            return Err(ConfigError::invalid(
                "health.failure_alert_threshold",
                "must be at least 1",
            ));
        }
        if let Some(0) = self.health.heartbeat_interval_hours {
            return Err(ConfigError::invalid(
                "health.heartbeat_interval_hours",
                "must be at least 1",
            ));
        }
        if let Some(target) = self.health.target_provider.as_mut() {
            *target = target.trim().to_lowercase();
        }

        self.ai.sanitize()?;
        self.filters.normalize();
        self.providers = std::mem::take(&mut self.providers)
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .collect();
        Ok(())
    }

    /// Names of provider sections with `enabled = true`.
    pub fn enabled_providers(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Variable name of an `env:NAME` reference.
pub(crate) fn env_reference(value: &str) -> Option<&str> {
    value.strip_prefix(ENV_PREFIX).map(str::trim)
}

fn resolve_env_refs<F>(value: &mut toml::Value, key: &str, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        toml::Value::String(s) => {
            if let Some(var) = env_reference(s) {
                *s = lookup(var).ok_or_else(|| ConfigError::MissingEnv {
                    key: key.to_string(),
                    var: var.to_string(),
                })?;
            }
        }
        toml::Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                resolve_env_refs(item, &format!("{key}[{i}]"), lookup)?;
            }
        }
        toml::Value::Table(table) => {
            for (k, v) in table.iter_mut() {
                let child = if key.is_empty() {
                    k.clone()
                } else {
                    format!("{key}.{k}")
                };
                resolve_env_refs(v, &child, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}
