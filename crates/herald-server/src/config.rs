//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its JSON over the defaults
//! 3. Apply `HERALD_*` environment overrides (highest priority)
//! 4. [`ServerConfig::validate`]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    pub database_path: PathBuf,
    /// Warn+ log persistence. `None` keeps logs on stdout only.
    pub log_database_path: Option<PathBuf>,
    pub log_level: String,
    /// Frames buffered per connection before it is considered dead.
    pub outbound_queue_capacity: usize,
    pub registry_mailbox_capacity: usize,
    pub max_frame_bytes: usize,
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Kept below the 60s timeout clients put on the catch-up request.
    pub catchup_deadline_secs: u64,
    pub catchup_poll_interval_ms: u64,
    pub catchup_default_limit: u32,
    pub catchup_max_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            database_path: PathBuf::from("herald.db"),
            log_database_path: None,
            log_level: "info".into(),
            outbound_queue_capacity: 256,
            registry_mailbox_capacity: 1024,
            max_frame_bytes: 4096,
            ping_interval_secs: 30,
            read_timeout_secs: 60,
            write_timeout_secs: 10,
            catchup_deadline_secs: 59,
            catchup_poll_interval_ms: 1000,
            catchup_default_limit: 50,
            catchup_max_limit: 500,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn catchup_deadline(&self) -> Duration {
        Duration::from_secs(self.catchup_deadline_secs)
    }

    pub fn catchup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.catchup_poll_interval_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidValue(msg));

        if self.ping_interval_secs == 0 || self.ping_interval_secs >= self.read_timeout_secs {
            return invalid(format!(
                "ping_interval_secs ({}) must be non-zero and below read_timeout_secs ({})",
                self.ping_interval_secs, self.read_timeout_secs
            ));
        }
        if self.write_timeout_secs == 0 {
            return invalid("write_timeout_secs must be non-zero".into());
        }
        if self.outbound_queue_capacity == 0 || self.registry_mailbox_capacity == 0 {
            return invalid("queue capacities must be non-zero".into());
        }
        if self.max_frame_bytes == 0 {
            return invalid("max_frame_bytes must be non-zero".into());
        }
        if self.catchup_poll_interval_ms == 0
            || self.catchup_poll_interval() >= self.catchup_deadline()
        {
            return invalid(format!(
                "catchup_poll_interval_ms ({}) must be non-zero and below catchup_deadline_secs ({})",
                self.catchup_poll_interval_ms, self.catchup_deadline_secs
            ));
        }
        if self.catchup_default_limit == 0 || self.catchup_default_limit > self.catchup_max_limit {
            return invalid(format!(
                "catchup_default_limit ({}) must be in 1..={}",
                self.catchup_default_limit, self.catchup_max_limit
            ));
        }
        Ok(())
    }
}

/// Load configuration: defaults, then the optional JSON file, then env.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config file");
            let content = std::fs::read_to_string(path)?;
            let overlay: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, overlay)
        }
        Some(path) => {
            warn!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Recursive merge: objects merge per key, everything else is replaced, and
/// `null` in the overlay keeps the base value.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Apply `HERALD_*` overrides read through `lookup`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let number = |key: &str, min: u64, max: u64| -> Option<u64> {
        let raw = string(key)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            warn!(key, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("HERALD_HOST") {
        config.host = v;
    }
    if let Some(v) = number("HERALD_PORT", 0, u64::from(u16::MAX)) {
        config.port = v as u16;
    }
    if let Some(v) = string("HERALD_DATABASE") {
        config.database_path = PathBuf::from(v);
    }
    if let Some(v) = string("HERALD_LOG_DATABASE") {
        config.log_database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = string("HERALD_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = number("HERALD_OUTBOUND_QUEUE", 1, 1 << 20) {
        config.outbound_queue_capacity = v as usize;
    }
    if let Some(v) = number("HERALD_MAX_FRAME_BYTES", 64, 1 << 24) {
        config.max_frame_bytes = v as usize;
    }
    if let Some(v) = number("HERALD_PING_INTERVAL_SECS", 1, 3600) {
        config.ping_interval_secs = v;
    }
    if let Some(v) = number("HERALD_READ_TIMEOUT_SECS", 1, 3600) {
        config.read_timeout_secs = v;
    }
    if let Some(v) = number("HERALD_CATCHUP_DEADLINE_SECS", 1, 3600) {
        config.catchup_deadline_secs = v;
    }
    if let Some(v) = number("HERALD_CATCHUP_POLL_INTERVAL_MS", 10, 60_000) {
        config.catchup_poll_interval_ms = v;
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
