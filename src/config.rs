//! Server configuration.
//!
//! Values come from an optional TOML file; the binary layers CLI flags on top.

use crate::error::{RelayError, Result};
use crate::protocol::MAX_FRAME_SIZE;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 12345;
pub const DEFAULT_STORAGE_DIR: &str = "server_files";

/// Largest upload accepted by default (1GB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Where uploaded files are stored
    pub storage_dir: PathBuf,
    /// Largest accepted frame payload
    pub max_frame_size: u32,
    /// Largest accepted upload
    pub max_file_size: u64,
    /// Drop a peer that sends nothing for this long (unset = wait forever)
    pub idle_timeout_secs: Option<u64>,
    /// Max gap between Data frames during an upload
    pub transfer_timeout_secs: u64,
    /// A send slower than this counts as a failed send
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            max_frame_size: MAX_FRAME_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            idle_timeout_secs: None,
            transfer_timeout_secs: 60,
            write_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(RelayError::Config("max_frame_size must be positive".into()));
        }
        if self.transfer_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(RelayError::Config("timeouts must be positive".into()));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(RelayError::Config("idle_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}
