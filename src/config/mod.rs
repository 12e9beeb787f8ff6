//! # Configuration Management Module
//!
//! TOML configuration for the console, with `RETROBADGE_*` environment overrides.
//!
//! ## Configuration Structure
//!
//! - [`LinkConfig`] - Device path, baud rate, handshake and drain timing
//! - [`BackoffConfig`] - Reconnect delay schedule
//! - [`StorageConfig`] - Data directory, replay limit, message length cap
//! - [`QueueConfig`] - Inbox / outbox / packet channel capacities
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use retrobadge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("retrobadge.toml").await?;
//!     config.apply_env_overrides(std::env::vars())?;
//!     config.validate()?;
//!     println!("Device: {}", config.link.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [link]
//! port = "/dev/rfcomm0"
//! baud_rate = 115200
//! auto_scan = true
//! handshake_timeout_secs = 15
//! drain_poll_ms = 150
//!
//! [backoff]
//! base_secs = 5
//! step_secs = 5
//! max_secs = 60
//!
//! [storage]
//! data_dir = ""          # empty: ~/.retrobadge
//! replay_limit = 2000
//! max_message_len = 240
//! raw_log = true
//! ```
//!
//! Precedence: CLI args > Environment > Config file > Defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::link::BackoffPolicy;
use crate::message::DEFAULT_MAX_LEN;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "RETROBADGE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial device path; Bluetooth links appear as `/dev/rfcomm*`.
    pub port: String,
    pub baud_rate: u32,
    /// Try the first enumerated USB serial port when `port` cannot be opened.
    pub auto_scan: bool,
    /// Seconds allowed for the configuration handshake after open.
    pub handshake_timeout_secs: u64,
    /// Outbox wait while connected (ms).
    pub drain_poll_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/rfcomm0".to_string(),
            baud_rate: 115200,
            auto_scan: true,
            handshake_timeout_secs: 15,
            drain_poll_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    /// Added per consecutive failure; 0 gives a fixed delay.
    pub step_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 5,
            step_secs: 5,
            max_secs: 60,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.base_secs),
            Duration::from_secs(self.step_secs),
            Duration::from_secs(self.max_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Empty selects `~/.retrobadge`.
    pub data_dir: String,
    /// Messages replayed into the console at startup.
    pub replay_limit: usize,
    /// Upper bound on stored/sent message text, in bytes.
    pub max_message_len: usize,
    /// Write every inbound packet and link event to `meshtastic.log`.
    pub raw_log: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            replay_limit: 2000,
            max_message_len: DEFAULT_MAX_LEN,
            raw_log: true,
        }
    }
}

impl StorageConfig {
    /// Resolve the data directory, falling back to `~/.retrobadge`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        if !self.data_dir.trim().is_empty() {
            return Ok(PathBuf::from(self.data_dir.trim()));
        }
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow!("cannot determine home directory; set storage.data_dir"))?;
        Ok(base.home_dir().join(".retrobadge"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub inbox_capacity: usize,
    pub outbox_capacity: usize,
    /// Transport → ingest channel.
    pub packet_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            outbox_capacity: 256,
            packet_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `RETROBADGE_*` overrides from `vars` (normally `std::env::vars()`).
    /// Unknown keys are ignored; unparsable values are an error naming the key.
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            let key = key.as_ref();
            match name {
                "PORT" => self.link.port = value.to_string(),
                "BAUD" => self.link.baud_rate = parse(key, value)?,
                "DATA_DIR" => self.storage.data_dir = value.to_string(),
                "REPLAY_LIMIT" => self.storage.replay_limit = parse(key, value)?,
                "MAX_LEN" => self.storage.max_message_len = parse(key, value)?,
                "INBOX_CAPACITY" => self.queues.inbox_capacity = parse(key, value)?,
                "OUTBOX_CAPACITY" => self.queues.outbox_capacity = parse(key, value)?,
                "BACKOFF_BASE_SECS" => self.backoff.base_secs = parse(key, value)?,
                "BACKOFF_STEP_SECS" => self.backoff.step_secs = parse(key, value)?,
                "BACKOFF_MAX_SECS" => self.backoff.max_secs = parse(key, value)?,
                "HANDSHAKE_TIMEOUT_SECS" => self.link.handshake_timeout_secs = parse(key, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.link.port.trim().is_empty() {
            bail!("link.port must not be empty");
        }
        if self.storage.max_message_len == 0 {
            bail!("storage.max_message_len must be at least 1");
        }
        if self.storage.replay_limit == 0 {
            bail!("storage.replay_limit must be at least 1");
        }
        if self.queues.inbox_capacity == 0
            || self.queues.outbox_capacity == 0
            || self.queues.packet_capacity == 0
        {
            bail!("queue capacities must be at least 1");
        }
        if self.backoff.base_secs > self.backoff.max_secs {
            bail!(
                "backoff.base_secs ({}) exceeds backoff.max_secs ({})",
                self.backoff.base_secs,
                self.backoff.max_secs
            );
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value for {}: '{}'", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.link.port, "/dev/rfcomm0");
        assert_eq!(config.link.handshake_timeout_secs, 15);
        assert_eq!(config.storage.replay_limit, 2000);
        assert_eq!(config.storage.max_message_len, 240);
        assert_eq!(config.queues.inbox_capacity, 1024);
        assert_eq!(config.queues.outbox_capacity, 256);
        assert_eq!(config.backoff.policy().delay(0), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [link]
            port = "/dev/ttyUSB0"

            [backoff]
            step_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.link.port, "/dev/ttyUSB0");
        assert_eq!(config.link.baud_rate, 115200);
        assert_eq!(config.backoff.base_secs, 5);
        assert_eq!(config.backoff.policy().delay(9), Duration::from_secs(5));
        assert_eq!(config.storage.replay_limit, 2000);
    }

    #[test]
    fn env_overrides_apply_and_ignore_foreign_keys() {
        let mut config = Config::default();
        config
            .apply_env_overrides(vec![
                ("RETROBADGE_PORT", "/dev/ttyACM0"),
                ("RETROBADGE_REPLAY_LIMIT", "50"),
                ("RETROBADGE_MAX_LEN", " 120 "),
                ("RETROBADGE_BACKOFF_MAX_SECS", "30"),
                ("HOME", "/root"),
                ("RETROBADGE_UNKNOWN", "x"),
            ])
            .unwrap();
        assert_eq!(config.link.port, "/dev/ttyACM0");
        assert_eq!(config.storage.replay_limit, 50);
        assert_eq!(config.storage.max_message_len, 120);
        assert_eq!(config.backoff.max_secs, 30);
    }

    #[test]
    fn bad_env_number_names_the_variable() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(vec![("RETROBADGE_INBOX_CAPACITY", "lots")])
            .unwrap_err();
        assert!(err.to_string().contains("RETROBADGE_INBOX_CAPACITY"));
    }

    #[test]
    fn validate_rejects_inverted_backoff_and_zero_capacity() {
        let mut config = Config::default();
        config.backoff.base_secs = 90;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queues.outbox_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_data_dir_wins() {
        let storage = StorageConfig {
            data_dir: "/tmp/badge".into(),
            ..Default::default()
        };
        assert_eq!(storage.resolved_data_dir().unwrap(), PathBuf::from("/tmp/badge"));
    }

    #[test]
    fn load_round_trips_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retrobadge.toml");
        let path = path.to_str().unwrap().to_string();
        tokio_test::block_on(async {
            Config::create_default(&path).await.unwrap();
            let loaded = Config::load(&path).await.unwrap();
            assert_eq!(loaded.link.port, Config::default().link.port);
            assert_eq!(loaded.queues.packet_capacity, 256);
        });
    }
}
