// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Enforcement synchronizer.
//!
//! Makes the network layer's forwarding decision for one address match a
//! desired state. It is the only writer of live network configuration and
//! never touches the device store. Callers hold the device's lock, so a
//! grant and a revoke for the same address never interleave.
//!
//! Network calls are retried a bounded number of times with exponential
//! backoff. A grant that still fails is rolled back to the reachability the
//! address had before the attempt, so the device is never left
//! half-authorized and an already reachable device is not cut off by a
//! failed re-grant. The error is then returned and the next reconcile pass
//! is expected to finish the job.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::audit::AuditLogger;
use crate::error::NetworkError;
use crate::network::NetworkLayer;
use crate::session::{SessionEvent, SessionTracker};
use crate::types::DeviceAddress;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Maximum delay for exponential backoff (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 1000;

/// A change reconcile had to make for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    Granted(DeviceAddress),
    Revoked(DeviceAddress),
    PeerRemoved(DeviceAddress),
}

impl Correction {
    pub fn address(&self) -> DeviceAddress {
        match self {
            Self::Granted(a) | Self::Revoked(a) | Self::PeerRemoved(a) => *a,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted(_) => "granted",
            Self::Revoked(_) => "revoked",
            Self::PeerRemoved(_) => "peer_removed",
        }
    }
}

pub struct Enforcer {
    network: Arc<dyn NetworkLayer>,
    audit: Arc<AuditLogger>,
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Enforcer {
    pub fn new(network: Arc<dyn NetworkLayer>, audit: Arc<AuditLogger>, retries: u32) -> Self {
        Self {
            network,
            audit,
            retries,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }

    /// Override the backoff schedule.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    pub fn network(&self) -> &Arc<dyn NetworkLayer> {
        &self.network
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    async fn set_reachable_with_retry(&self, address: DeviceAddress, reachable: bool) -> Result<(), NetworkError> {
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                tracing::debug!(
                    target: "enforcement",
                    %address,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying network update"
                );
                sleep(delay).await;
            }
            match self.network.set_reachable(address, reachable).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(target: "enforcement", %address, reachable, error = %e, "Network update failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NetworkError::new("set_reachable", "no attempt made")))
    }

    /// Allow `address` to forward. On failure the prior reachability is
    /// restored.
    pub async fn grant(&self, address: DeviceAddress) -> Result<(), NetworkError> {
        // Unknown prior state is treated as unreachable.
        let was_reachable = match self.network.query_reachable(address).await {
            Ok(reachable) => reachable,
            Err(e) => {
                tracing::warn!(
                    target: "enforcement",
                    %address,
                    error = %e,
                    "Could not read reachability before grant"
                );
                false
            }
        };

        match self.set_reachable_with_retry(address, true).await {
            Ok(()) => {
                tracing::info!(target: "enforcement", %address, "Granted network access");
                self.audit.record("GRANT", Some(address), "reachable=true");
                Ok(())
            }
            Err(e) => {
                if !was_reachable {
                    if let Err(rollback) = self.network.set_reachable(address, false).await {
                        tracing::error!(
                            target: "enforcement",
                            %address,
                            error = %rollback,
                            "Rollback after failed grant also failed"
                        );
                    }
                }
                tracing::error!(target: "enforcement", %address, was_reachable, error = %e, "Grant failed");
                self.audit.record("GRANT_FAILED", Some(address), e.to_string());
                Err(e)
            }
        }
    }

    /// Terminate the session for `address` and stop it forwarding.
    ///
    /// The session is removed first and unconditionally: even if the
    /// network update fails, no session record is left referencing a device
    /// that should be unreachable.
    pub async fn revoke(
        &self,
        sessions: &SessionTracker,
        address: DeviceAddress,
        reason: &str,
    ) -> Result<Option<SessionEvent>, NetworkError> {
        let terminated = sessions.remove(address, reason);

        match self.set_reachable_with_retry(address, false).await {
            Ok(()) => {
                tracing::info!(target: "enforcement", %address, reason, "Revoked network access");
                self.audit.record("REVOKE", Some(address), format!("reason={}", reason));
                Ok(terminated)
            }
            Err(e) => {
                tracing::error!(target: "enforcement", %address, error = %e, "Revoke failed");
                self.audit.record("REVOKE_FAILED", Some(address), e.to_string());
                Err(e)
            }
        }
    }

    /// Remove the tunnel peer for `address`.
    pub async fn remove_peer(&self, address: DeviceAddress) -> Result<(), NetworkError> {
        let mut last_error = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                sleep(self.backoff(attempt)).await;
            }
            match self.network.remove_peer(address).await {
                Ok(()) => {
                    self.audit.record("PEER_REMOVED", Some(address), "");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(target: "enforcement", %address, error = %e, "Peer removal failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NetworkError::new("remove_peer", "no attempt made")))
    }

    /// Bring one address to `desired` given what the network currently
    /// reports. Returns the correction applied, if any.
    pub async fn converge(
        &self,
        sessions: &SessionTracker,
        address: DeviceAddress,
        desired: bool,
        actual: bool,
    ) -> Result<Option<Correction>, NetworkError> {
        match (desired, actual) {
            (true, false) => {
                self.grant(address).await?;
                Ok(Some(Correction::Granted(address)))
            }
            (false, true) => {
                self.revoke(sessions, address, "reconcile").await?;
                Ok(Some(Correction::Revoked(address)))
            }
            _ => Ok(None),
        }
    }
}
