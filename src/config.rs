// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gateway configuration.
//!
//! Loaded once at startup from a JSON file. Every field has a default so a
//! minimal file (even `{}`) is valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Default control-plane socket.
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/wag.sock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardConfig {
    /// Interface name the overlay runs on
    #[serde(default = "default_dev_name")]
    pub dev_name: String,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            dev_name: default_dev_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Consecutive failures before a device is locked
    #[serde(default = "default_lockout")]
    pub lockout: u32,
    /// Idle time after which a session is expired
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// How often the expiry sweep runs
    #[serde(default = "default_expiry_sweep_secs")]
    pub expiry_sweep_secs: u64,
    /// How often enforcement is fully reconciled against the store
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Control-plane socket path
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
    /// Device store file
    #[serde(default = "default_database_location")]
    pub database_location: PathBuf,
    #[serde(default)]
    pub wireguard: WireguardConfig,
    /// Optional audit log file
    #[serde(default)]
    pub audit_log: Option<PathBuf>,
    /// Immediate retries for a failed network-layer call
    #[serde(default = "default_enforcement_retries")]
    pub enforcement_retries: u32,
}

fn default_lockout() -> u32 {
    5
}

fn default_session_timeout_secs() -> u64 {
    3600
}

fn default_expiry_sweep_secs() -> u64 {
    30
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_control_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_SOCKET)
}

fn default_database_location() -> PathBuf {
    PathBuf::from("devices.json")
}

fn default_dev_name() -> String {
    "wg0".to_string()
}

fn default_enforcement_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lockout: default_lockout(),
            session_timeout_secs: default_session_timeout_secs(),
            expiry_sweep_secs: default_expiry_sweep_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            control_socket: default_control_socket(),
            database_location: default_database_location(),
            wireguard: WireguardConfig::default(),
            audit_log: None,
            enforcement_retries: default_enforcement_retries(),
        }
    }
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lockout == 0 {
            bail!("lockout must be at least 1");
        }
        if self.session_timeout_secs == 0 {
            bail!("session_timeout_secs must be greater than zero");
        }
        if self.expiry_sweep_secs == 0 || self.reconcile_interval_secs == 0 {
            bail!("background intervals must be greater than zero");
        }
        if self.wireguard.dev_name.trim().is_empty() {
            bail!("wireguard.dev_name must not be empty");
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
