// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scheduled background passes: session expiry and periodic reconcile.
//!
//! Each pass is an independent task that only calls the gateway's public
//! entry points, so it takes the same per-device locks as control-plane
//! commands. Both stop when the gateway requests shutdown; a pass that is
//! running finishes the device it is on and aborts before the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::Gateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Expiry,
    Reconcile,
}

impl Pass {
    fn name(&self) -> &'static str {
        match self {
            Pass::Expiry => "expiry",
            Pass::Reconcile => "reconcile",
        }
    }
}

/// Handles to the running background tasks.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Start both passes with the intervals from `config`.
    pub fn spawn(gateway: Arc<Gateway>, config: &Config) -> Self {
        Self::spawn_with_intervals(gateway, config.expiry_sweep_interval(), config.reconcile_interval())
    }

    pub fn spawn_with_intervals(gateway: Arc<Gateway>, expiry: Duration, reconcile: Duration) -> Self {
        let handles = vec![
            tokio::spawn(run_pass(Arc::clone(&gateway), Pass::Expiry, expiry)),
            tokio::spawn(run_pass(gateway, Pass::Reconcile, reconcile)),
        ];
        Self { handles }
    }

    /// Wait for every task to stop. Call after [`Gateway::request_shutdown`].
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(target: "background", error = %e, "Background task panicked");
            }
        }
    }
}

async fn run_pass(gateway: Arc<Gateway>, pass: Pass, period: Duration) {
    let mut shutdown = gateway.subscribe_shutdown();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already ran a reconcile.
    ticker.tick().await;

    tracing::debug!(target: "background", pass = pass.name(), period_secs = period.as_secs_f64(), "Started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let outcome = match pass {
            Pass::Expiry => gateway.expire_sessions(Instant::now()).await.map(|report| {
                for (address, e) in &report.failures {
                    tracing::error!(target: "background", %address, error = %e, "Expiry revoke failed");
                }
            }),
            Pass::Reconcile => gateway.reconcile().await.map(|report| {
                for (address, e) in &report.failures {
                    tracing::error!(target: "background", %address, error = %e, "Reconcile could not converge device");
                }
            }),
        };

        match outcome {
            Ok(()) => {}
            Err(GatewayError::ShutdownRequested) => break,
            Err(e) => {
                tracing::error!(target: "background", pass = pass.name(), error = %e, "Background pass failed");
            }
        }
    }

    tracing::debug!(target: "background", pass = pass.name(), "Stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::network::{MemoryNetwork, NetworkLayer};
    use crate::store::{DeviceStore, MemoryStore};
    use crate::types::{Device, DeviceAddress};

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_pass_heals_tampering_and_stops() {
        let store = Arc::new(MemoryStore::with_devices([Device::new(addr("10.0.0.2"), "alice", "a")]));
        let network = Arc::new(MemoryNetwork::new());
        let gateway = Arc::new(Gateway::new(
            &Config::default(),
            store as Arc<dyn DeviceStore>,
            Arc::clone(&network) as Arc<dyn NetworkLayer>,
            Arc::new(AuditLogger::in_memory()),
        ));

        let tasks = BackgroundTasks::spawn_with_intervals(
            Arc::clone(&gateway),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        network.tamper_reachable(addr("10.0.0.2"), true);
        let healed = tokio::time::timeout(Duration::from_secs(5), async {
            while network.is_reachable(addr("10.0.0.2")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(healed.is_ok(), "reconcile pass never revoked the tampered rule");

        gateway.request_shutdown();
        let joined = tokio::time::timeout(Duration::from_secs(5), tasks.join()).await;
        assert!(joined.is_ok(), "background tasks did not stop on shutdown");
    }
}
