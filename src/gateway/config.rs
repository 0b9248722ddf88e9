use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("account cache `redis` requires a redis url")]
    MissingRedisUrl,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountCacheKind {
    #[default]
    Store,
    Memory,
    Redis,
}

impl FromStr for AccountCacheKind {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "store" | "none" => Ok(Self::Store),
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// Channel registry refresh interval and account cache TTL.
    #[serde(default = "default_sync_frequency_secs")]
    pub sync_frequency_secs: u64,
    #[serde(default = "default_true")]
    pub memory_cache_enabled: bool,
    #[serde(default)]
    pub account_cache: AccountCacheKind,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    #[serde(default)]
    pub retry_times: u32,
    /// Upstream request timeout; 0 disables it.
    #[serde(default)]
    pub relay_timeout_secs: u64,
    /// Token reservations older than this are credited back; 0 disables.
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    #[serde(default)]
    pub enforce_include_usage: bool,
    #[serde(default = "default_pre_consumed_quota")]
    pub pre_consumed_quota: f64,
    #[serde(default = "default_true")]
    pub log_consume_enabled: bool,
    #[serde(default)]
    pub json_logs: bool,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field("sqlite_path", &self.sqlite_path)
            .field("sync_frequency_secs", &self.sync_frequency_secs)
            .field("memory_cache_enabled", &self.memory_cache_enabled)
            .field("account_cache", &self.account_cache)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<redacted>"))
            .field("redis_prefix", &self.redis_prefix)
            .field("retry_times", &self.retry_times)
            .field("relay_timeout_secs", &self.relay_timeout_secs)
            .field("reservation_ttl_secs", &self.reservation_ttl_secs)
            .field("enforce_include_usage", &self.enforce_include_usage)
            .field("pre_consumed_quota", &self.pre_consumed_quota)
            .field("log_consume_enabled", &self.log_consume_enabled)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sqlite_path: default_sqlite_path(),
            sync_frequency_secs: default_sync_frequency_secs(),
            memory_cache_enabled: true,
            account_cache: AccountCacheKind::default(),
            redis_url: None,
            redis_prefix: default_redis_prefix(),
            retry_times: 0,
            relay_timeout_secs: 0,
            reservation_ttl_secs: default_reservation_ttl_secs(),
            enforce_include_usage: false,
            pre_consumed_quota: default_pre_consumed_quota(),
            log_consume_enabled: true,
            json_logs: false,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("llm-relay.sqlite")
}

fn default_sync_frequency_secs() -> u64 {
    600
}

fn default_reservation_ttl_secs() -> u64 {
    3600
}

fn default_redis_prefix() -> String {
    "llm_relay".to_string()
}

fn default_pre_consumed_quota() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

impl RelayConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(listen) = get("LISTEN") {
            self.listen = listen;
        } else if let Some(port) = get("PORT") {
            let port: u16 = parse_env("PORT", &port)?;
            self.listen = format!("0.0.0.0:{port}");
        }
        if let Some(path) = get("SQLITE_PATH") {
            self.sqlite_path = PathBuf::from(path);
        }
        if let Some(value) = get("SYNC_FREQUENCY") {
            self.sync_frequency_secs = parse_env("SYNC_FREQUENCY", &value)?;
        }
        if let Some(value) = get("MEMORY_CACHE_ENABLED") {
            self.memory_cache_enabled = parse_bool_env("MEMORY_CACHE_ENABLED", &value)?;
        }
        if let Some(url) = get("REDIS_CONN_STRING") {
            self.redis_url = Some(url);
            self.account_cache = AccountCacheKind::Redis;
        }
        if let Some(value) = get("ACCOUNT_CACHE") {
            self.account_cache = value.parse().map_err(|()| ConfigError::InvalidEnv {
                key: "ACCOUNT_CACHE",
                value: value.clone(),
            })?;
        }
        if let Some(prefix) = get("REDIS_PREFIX") {
            self.redis_prefix = prefix;
        }
        if let Some(value) = get("RETRY_TIMES") {
            self.retry_times = parse_env("RETRY_TIMES", &value)?;
        }
        if let Some(value) = get("RELAY_TIMEOUT") {
            self.relay_timeout_secs = parse_env("RELAY_TIMEOUT", &value)?;
        }
        if let Some(value) = get("RESERVATION_TTL") {
            self.reservation_ttl_secs = parse_env("RESERVATION_TTL", &value)?;
        }
        if let Some(value) = get("ENFORCE_INCLUDE_USAGE") {
            self.enforce_include_usage = parse_bool_env("ENFORCE_INCLUDE_USAGE", &value)?;
        }
        if let Some(value) = get("PRE_CONSUMED_QUOTA") {
            self.pre_consumed_quota = parse_env("PRE_CONSUMED_QUOTA", &value)?;
        }
        if let Some(value) = get("LOG_CONSUME_ENABLED") {
            self.log_consume_enabled = parse_bool_env("LOG_CONSUME_ENABLED", &value)?;
        }
        if let Some(value) = get("JSON_LOGS") {
            self.json_logs = parse_bool_env("JSON_LOGS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_cache == AccountCacheKind::Redis && self.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

fn parse_bool_env(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: value.to_string(),
        }),
    }
}
