//! TOML configuration for the coordinator and worker binaries
//!
//! Everything here is checked by `validate()` before a socket is opened; a bad
//! path or a zero capacity is fatal at startup, never mid-session.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::timeouts;

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    /// CA bundle both sides' certificates chain to
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Identity expected from the peer this process dials
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsSettings {
    fn validate(&self) -> Result<()> {
        for (what, path) in [("ca", &self.ca), ("cert", &self.cert), ("key", &self.key)] {
            if !path.is_file() {
                bail!("tls.{} does not exist: {}", what, path.display());
            }
        }
        Ok(())
    }
}

/// Control-channel timing shared by both roles
#[derive(Debug, Clone, Copy)]
pub struct ControlTimeouts {
    pub frame: Duration,
    pub reply: Duration,
    /// Coordinator wait for the next worker frame; `None` waits forever
    pub idle: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub capacity: usize,
    pub pool_dir: PathBuf,
    pub max_file_size: u64,
    pub hash_file: PathBuf,
    pub results_path: PathBuf,
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Longest silence tolerated from a worker between frames. A worker reports
    /// once per processed wordlist, so this must cover the slowest one.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub coordinator: String,
    pub staging_dir: PathBuf,
    #[serde(default)]
    pub reserved_headroom: u64,
    /// Bytes a new request must be able to absorb: the pool's max file size
    pub max_file_size: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_data_bind_ip")]
    pub data_bind_ip: IpAddr,
    /// argv with `{hashes}` and `{wordlist}` placeholders
    pub command: Vec<String>,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

fn default_listen() -> String {
    "0.0.0.0:7600".to_string()
}
fn default_frame_timeout_ms() -> u64 {
    timeouts::FRAME_MS
}
fn default_reply_timeout_ms() -> u64 {
    timeouts::REPLY_MS
}
fn default_accept_timeout_ms() -> u64 {
    timeouts::ACCEPT_MS
}
fn default_poll_interval_ms() -> u64 {
    timeouts::BUDGET_POLL_MS
}
fn default_idle_timeout_secs() -> Option<u64> {
    Some(timeouts::IDLE_SECS)
}
fn default_data_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

impl CoordinatorConfig {
    /// Minimal config with defaults for everything optional
    pub fn new(
        pool_dir: impl Into<PathBuf>,
        hash_file: impl Into<PathBuf>,
        results_path: impl Into<PathBuf>,
        capacity: usize,
        max_file_size: u64,
    ) -> Self {
        CoordinatorConfig {
            listen: default_listen(),
            capacity,
            pool_dir: pool_dir.into(),
            max_file_size,
            hash_file: hash_file.into(),
            results_path: results_path.into(),
            ledger_path: None,
            frame_timeout_ms: default_frame_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            tls: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            bail!("capacity must be at least 1");
        }
        if self.max_file_size == 0 {
            bail!("max_file_size must be greater than zero");
        }
        if !self.pool_dir.is_dir() {
            bail!("pool_dir is not a directory: {}", self.pool_dir.display());
        }
        if !self.hash_file.is_file() {
            bail!("hash_file does not exist: {}", self.hash_file.display());
        }
        if let Some(parent) = self.results_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!("results_path directory does not exist: {}", parent.display());
            }
        }
        if self.frame_timeout_ms == 0 || self.reply_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    pub fn timeouts(&self) -> ControlTimeouts {
        ControlTimeouts {
            frame: Duration::from_millis(self.frame_timeout_ms),
            reply: Duration::from_millis(self.reply_timeout_ms),
            idle: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl WorkerConfig {
    pub fn new(
        coordinator: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
        max_file_size: u64,
        command: Vec<String>,
    ) -> Self {
        WorkerConfig {
            coordinator: coordinator.into(),
            staging_dir: staging_dir.into(),
            reserved_headroom: 0,
            max_file_size,
            poll_interval_ms: default_poll_interval_ms(),
            data_bind_ip: default_data_bind_ip(),
            command,
            frame_timeout_ms: default_frame_timeout_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            tls: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.coordinator.trim().is_empty() {
            bail!("coordinator address is empty");
        }
        if self.max_file_size == 0 {
            bail!("max_file_size must be greater than zero");
        }
        if self.command.is_empty() {
            bail!("command is empty");
        }
        if !self.command.iter().any(|arg| arg.contains("{wordlist}")) {
            bail!("command never references {{wordlist}}");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.frame_timeout_ms == 0 || self.reply_timeout_ms == 0 || self.accept_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    pub fn timeouts(&self) -> ControlTimeouts {
        ControlTimeouts {
            frame: Duration::from_millis(self.frame_timeout_ms),
            reply: Duration::from_millis(self.reply_timeout_ms),
            idle: None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}
