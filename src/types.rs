// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Canonical types used across wag.
//!
//! A device is identified by its overlay address. Everything else about
//! its authorization is either persisted on the [`Device`] record or
//! derived from it (see [`crate::authz`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::GatewayError;

/// Header line for the device listing served to the CLI.
pub const DEVICE_CSV_HEADER: &str = "username,address,publickey,enforcingmfa,authattempts";

/// Header line for the session listing served to the CLI.
pub const SESSION_CSV_HEADER: &str = "vpn_address,actual_endpoint";

/// Overlay address of a device inside the tunnel network. Primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(IpAddr);

impl DeviceAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// Host route for this address, as used in firewall rules and allowed-ips.
    pub fn host_cidr(&self) -> String {
        match self.0 {
            IpAddr::V4(v4) => format!("{}/32", v4),
            IpAddr::V6(v6) => format!("{}/128", v6),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Validation("device address must be supplied".to_string()));
        }
        // Accept "10.0.0.2/32" as found in peer tables.
        let host = trimmed.split('/').next().unwrap_or(trimmed);
        host.parse::<IpAddr>()
            .map(Self)
            .map_err(|_| GatewayError::Validation(format!("invalid device address: {}", trimmed)))
    }
}

impl From<IpAddr> for DeviceAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

/// Persistent device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Overlay address assigned to this device
    pub address: DeviceAddress,
    /// Owning identity; one user may own many devices
    pub username: String,
    /// WireGuard public key (base64)
    pub public_key: String,
    /// Whether MFA must be completed before the device may forward traffic
    #[serde(default = "default_enforcing_mfa")]
    pub enforcing_mfa: bool,
    /// Consecutive failed authentication attempts
    #[serde(default)]
    pub attempts: u32,
}

fn default_enforcing_mfa() -> bool {
    true
}

impl Device {
    pub fn new(address: DeviceAddress, username: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            address,
            username: username.into(),
            public_key: public_key.into(),
            enforcing_mfa: true,
            attempts: 0,
        }
    }

    /// Builder-style toggle for the MFA gate.
    pub fn with_enforcing_mfa(mut self, enforcing: bool) -> Self {
        self.enforcing_mfa = enforcing;
        self
    }

    /// Builder-style initial attempt counter.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_locked(&self, lockout: u32) -> bool {
        self.attempts >= lockout
    }

    /// One line of the device listing, matching [`DEVICE_CSV_HEADER`].
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.username, self.address, self.public_key, self.enforcing_mfa, self.attempts
        )
    }
}

/// Derived authorization state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationState {
    /// MFA is required and has not been completed
    Unauthenticated,
    /// MFA completed (or not required); forwarding allowed
    Authenticated,
    /// Too many failures or locked by an administrator; terminal until reset
    Locked,
}

impl AuthorizationState {
    /// Whether a device in this state may forward onto the protected network.
    pub fn allows_forwarding(&self) -> bool {
        matches!(self, AuthorizationState::Authenticated)
    }
}

impl fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorizationState::Unauthenticated => write!(f, "UNAUTHENTICATED"),
            AuthorizationState::Authenticated => write!(f, "AUTHENTICATED"),
            AuthorizationState::Locked => write!(f, "LOCKED"),
        }
    }
}
