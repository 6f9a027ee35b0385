//! Configuration system for Treecast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TREECAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/treecast/config.toml
//!   3. ~/.config/treecast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreecastConfig {
    pub storage: StorageConfig,
    pub radio: RadioConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding data files and their `.mkl` tree files.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Channel to tune to on startup.
    pub channel: u8,
    /// Highest channel the hardware supports.
    pub channel_max: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Receiver gives up after this long without hearing a packet.
    pub rx_timeout_ms: u64,
    /// What to do when a tree file turns out to be corrupt.
    pub fault_policy: FaultPolicy,
    /// Fixed receiver station id. None = pick one at random per session.
    pub station_id: Option<u16>,
    /// Yield requests a complete receiver sends before leaving anyway.
    pub max_yield_requests: u32,
    /// Beacon rounds without any request before a transmitter stops early.
    pub idle_rounds: u32,
    /// Beacons offered to a yield target before revoking the offer.
    pub yield_attempts: u32,
    /// How long to wait for the yield target to start transmitting.
    pub yield_listen_ms: u64,
    /// Time slice spent scanning for missing chunks between other work.
    pub scan_budget_ms: u64,
}

/// Reaction to a corrupt tree file or a misused tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Panic on the spot. For development and tests.
    Strict,
    /// Log, latch a fault on the tree, and report failure to the caller.
    #[default]
    Lenient,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("files"),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            channel_max: 125,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rx_timeout_ms: 5_000,
            fault_policy: FaultPolicy::Lenient,
            station_id: None,
            max_yield_requests: 25,
            idle_rounds: 10,
            yield_attempts: 5,
            yield_listen_ms: 1_000,
            scan_budget_ms: 10,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("treecast")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("treecast")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("radio.channel {channel} is above radio.channel_max {max}")]
    ChannelOutOfRange { channel: u8, max: u8 },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TreecastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TreecastConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the radio cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radio.channel > self.radio.channel_max {
            return Err(ConfigError::ChannelOutOfRange {
                channel: self.radio.channel,
                max: self.radio.channel_max,
            });
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TREECAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = TreecastConfig::default().to_toml()?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    /// Apply TREECAST_* overrides read through `var`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("TREECAST_STORAGE__ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(p) = var("TREECAST_RADIO__CHANNEL").and_then(|v| v.parse().ok()) {
            self.radio.channel = p;
        }
        if let Some(p) = var("TREECAST_RADIO__CHANNEL_MAX").and_then(|v| v.parse().ok()) {
            self.radio.channel_max = p;
        }
        if let Some(p) = var("TREECAST_SESSION__RX_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.session.rx_timeout_ms = p;
        }
        if let Some(v) = var("TREECAST_SESSION__FAULT_POLICY") {
            match v.as_str() {
                "strict" => self.session.fault_policy = FaultPolicy::Strict,
                "lenient" => self.session.fault_policy = FaultPolicy::Lenient,
                _ => {}
            }
        }
        if let Some(p) = var("TREECAST_SESSION__STATION_ID").and_then(|v| v.parse().ok()) {
            self.session.station_id = Some(p);
        }
        if let Some(p) = var("TREECAST_SESSION__IDLE_ROUNDS").and_then(|v| v.parse().ok()) {
            self.session.idle_rounds = p;
        }
    }
}
