// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session tracker.
//!
//! Maps a device's overlay address to the real endpoint it was last seen
//! from and when. Presence of a session is what makes an MFA device
//! `Authenticated`, so this table is only mutated by the gateway while it
//! holds the device's lock. Readers ([`SessionTracker::snapshot`]) take a
//! point-in-time copy and never block writers for longer than the copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::security::{resilient_read, resilient_write};
use crate::types::{DeviceAddress, SESSION_CSV_HEADER};

/// One authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub address: DeviceAddress,
    /// Real endpoint of the current tunnel handshake, once observed
    pub endpoint: Option<SocketAddr>,
    pub created_at: DateTime<Utc>,
    last_seen: Instant,
}

impl Session {
    fn new(address: DeviceAddress, endpoint: Option<SocketAddr>) -> Self {
        Self {
            address,
            endpoint,
            created_at: Utc::now(),
            last_seen: Instant::now(),
        }
    }

    /// Time since the last touch.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Session lifecycle events, one audit line each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created {
        address: DeviceAddress,
        endpoint: Option<SocketAddr>,
    },
    Refreshed {
        address: DeviceAddress,
        endpoint: Option<SocketAddr>,
    },
    Expired {
        address: DeviceAddress,
        idle_secs: u64,
    },
    Terminated {
        address: DeviceAddress,
        reason: String,
    },
}

impl SessionEvent {
    pub fn address(&self) -> DeviceAddress {
        match self {
            Self::Created { address, .. }
            | Self::Refreshed { address, .. }
            | Self::Expired { address, .. }
            | Self::Terminated { address, .. } => *address,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "SESSION_CREATED",
            Self::Refreshed { .. } => "SESSION_REFRESHED",
            Self::Expired { .. } => "SESSION_EXPIRED",
            Self::Terminated { .. } => "SESSION_TERMINATED",
        }
    }

    /// Format event for the audit log
    pub fn to_audit_string(&self) -> String {
        let detail = match self {
            Self::Created { endpoint, .. } | Self::Refreshed { endpoint, .. } => {
                format!("endpoint={}", render_endpoint(endpoint.as_ref()))
            }
            Self::Expired { idle_secs, .. } => format!("idle={}s", idle_secs),
            Self::Terminated { reason, .. } => format!("reason={}", reason),
        };
        format!("{} | address={} {}", self.name(), self.address(), detail)
    }
}

fn render_endpoint(endpoint: Option<&SocketAddr>) -> String {
    endpoint.map(ToString::to_string).unwrap_or_else(|| "-".to_string())
}

/// Point-in-time copy of the session table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    entries: Vec<(DeviceAddress, Option<SocketAddr>)>,
}

impl SessionSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DeviceAddress, Option<SocketAddr>)> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = DeviceAddress> + '_ {
        self.entries.iter().map(|(address, _)| *address)
    }

    /// CSV listing served to the CLI.
    pub fn render(&self) -> String {
        let mut out = String::from(SESSION_CSV_HEADER);
        for (address, endpoint) in &self.entries {
            out.push('\n');
            out.push_str(&format!("{},{}", address, render_endpoint(endpoint.as_ref())));
        }
        out
    }
}

impl IntoIterator for SessionSnapshot {
    type Item = (DeviceAddress, Option<SocketAddr>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[derive(Debug)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<DeviceAddress, Session>>,
    timeout: Duration,
}

impl SessionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create a session, replacing any existing one for the address.
    pub fn open(&self, address: DeviceAddress, endpoint: Option<SocketAddr>) -> SessionEvent {
        resilient_write(&self.sessions).insert(address, Session::new(address, endpoint));
        let event = SessionEvent::Created { address, endpoint };
        tracing::info!(target: "session", "{}", event.to_audit_string());
        event
    }

    /// Refresh an existing session. A new endpoint replaces the old one;
    /// `None` keeps it. Returns `None` when there is no session.
    pub fn refresh(&self, address: DeviceAddress, endpoint: Option<SocketAddr>) -> Option<SessionEvent> {
        let mut sessions = resilient_write(&self.sessions);
        let session = sessions.get_mut(&address)?;
        session.last_seen = Instant::now();
        if endpoint.is_some() {
            session.endpoint = endpoint;
        }
        let event = SessionEvent::Refreshed {
            address,
            endpoint: session.endpoint,
        };
        tracing::trace!(target: "session", "{}", event.to_audit_string());
        Some(event)
    }

    /// Terminate a session. Returns the event if one existed.
    pub fn remove(&self, address: DeviceAddress, reason: &str) -> Option<SessionEvent> {
        resilient_write(&self.sessions).remove(&address)?;
        let event = SessionEvent::Terminated {
            address,
            reason: reason.to_string(),
        };
        tracing::info!(target: "session", "{}", event.to_audit_string());
        Some(event)
    }

    /// Remove the session only if it is still idle past the timeout at `now`.
    /// A touch that landed after the sweep picked the address keeps it alive.
    pub fn expire_if_idle(&self, address: DeviceAddress, now: Instant) -> Option<SessionEvent> {
        let mut sessions = resilient_write(&self.sessions);
        let idle = sessions.get(&address)?.idle_for(now);
        if idle <= self.timeout {
            return None;
        }
        sessions.remove(&address);
        let event = SessionEvent::Expired {
            address,
            idle_secs: idle.as_secs(),
        };
        tracing::info!(target: "session", "{}", event.to_audit_string());
        Some(event)
    }

    /// Addresses idle past the timeout at `now`. Read-only.
    pub fn idle_addresses(&self, now: Instant) -> Vec<DeviceAddress> {
        let mut idle: Vec<DeviceAddress> = resilient_read(&self.sessions)
            .values()
            .filter(|s| s.idle_for(now) > self.timeout)
            .map(|s| s.address)
            .collect();
        idle.sort();
        idle
    }

    pub fn contains(&self, address: DeviceAddress) -> bool {
        resilient_read(&self.sessions).contains_key(&address)
    }

    pub fn get(&self, address: DeviceAddress) -> Option<Session> {
        resilient_read(&self.sessions).get(&address).cloned()
    }

    /// Addresses with a session, sorted.
    pub fn addresses(&self) -> Vec<DeviceAddress> {
        let mut addresses: Vec<DeviceAddress> = resilient_read(&self.sessions).keys().copied().collect();
        addresses.sort();
        addresses
    }

    /// Live sessions only. An idle session the sweep has not reached yet is
    /// left out.
    pub fn snapshot(&self) -> SessionSnapshot {
        let now = Instant::now();
        let mut entries: Vec<(DeviceAddress, Option<SocketAddr>)> = resilient_read(&self.sessions)
            .values()
            .filter(|s| s.idle_for(now) <= self.timeout)
            .map(|s| (s.address, s.endpoint))
            .collect();
        entries.sort_by_key(|(address, _)| *address);
        SessionSnapshot { entries }
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every session. Used on teardown.
    pub fn clear(&self) -> usize {
        let mut sessions = resilient_write(&self.sessions);
        let count = sessions.len();
        sessions.clear();
        count
    }
}
