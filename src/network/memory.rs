// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process network layer.
//!
//! Tracks the peer table and allow-list without touching the host. Used by
//! `start --noiptables` and throughout the tests, where the mutation
//! counter and failure injection make idempotence and retry behavior
//! observable.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::NetworkLayer;
use crate::error::NetworkError;
use crate::security::resilient_lock;
use crate::types::DeviceAddress;

#[derive(Debug, Default)]
struct Tables {
    peers: BTreeSet<DeviceAddress>,
    reachable: BTreeSet<DeviceAddress>,
}

#[derive(Debug, Default)]
pub struct MemoryNetwork {
    tables: Mutex<Tables>,
    installed: AtomicBool,
    mutations: AtomicUsize,
    /// Number of upcoming mutating calls that fail before succeeding again
    pending_failures: AtomicU32,
    /// Fail every mutating call until cleared
    failing: AtomicBool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the given peers configured (as the tunnel interface would
    /// after loading its config).
    pub fn with_peers(peers: impl IntoIterator<Item = DeviceAddress>) -> Self {
        let network = Self::new();
        resilient_lock(&network.tables).peers.extend(peers);
        network
    }

    pub fn add_peer(&self, address: DeviceAddress) {
        resilient_lock(&self.tables).peers.insert(address);
    }

    /// Change the allow-list behind the gateway's back, as an operator
    /// editing firewall rules by hand would.
    pub fn tamper_reachable(&self, address: DeviceAddress, reachable: bool) {
        let mut tables = resilient_lock(&self.tables);
        if reachable {
            tables.reachable.insert(address);
        } else {
            tables.reachable.remove(&address);
        }
    }

    pub fn is_reachable(&self, address: DeviceAddress) -> bool {
        resilient_lock(&self.tables).reachable.contains(&address)
    }

    pub fn has_peer(&self, address: DeviceAddress) -> bool {
        resilient_lock(&self.tables).peers.contains(&address)
    }

    pub fn reachable(&self) -> BTreeSet<DeviceAddress> {
        resilient_lock(&self.tables).reachable.clone()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Count of calls that actually changed a table.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Make the next `count` mutating calls fail.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<(), NetworkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NetworkError::new(operation, "injected failure"));
        }
        let consumed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(NetworkError::new(operation, "injected transient failure"));
        }
        Ok(())
    }

    fn mutated(&self, changed: bool) {
        if changed {
            self.mutations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl NetworkLayer for MemoryNetwork {
    async fn setup(&self) -> Result<(), NetworkError> {
        self.check("setup")?;
        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_reachable(&self, address: DeviceAddress, reachable: bool) -> Result<(), NetworkError> {
        self.check("set_reachable")?;
        let changed = {
            let mut tables = resilient_lock(&self.tables);
            if reachable {
                tables.reachable.insert(address)
            } else {
                tables.reachable.remove(&address)
            }
        };
        self.mutated(changed);
        Ok(())
    }

    async fn remove_peer(&self, address: DeviceAddress) -> Result<(), NetworkError> {
        self.check("remove_peer")?;
        let changed = resilient_lock(&self.tables).peers.remove(&address);
        self.mutated(changed);
        Ok(())
    }

    async fn list_peers(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError> {
        Ok(resilient_lock(&self.tables).peers.clone())
    }

    async fn list_reachable(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError> {
        Ok(resilient_lock(&self.tables).reachable.clone())
    }

    async fn teardown(&self) -> Result<(), NetworkError> {
        resilient_lock(&self.tables).reachable.clear();
        self.installed.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_set_reachable_is_idempotent() {
        let network = MemoryNetwork::new();
        network.set_reachable(addr("10.0.0.2"), true).await.unwrap();
        network.set_reachable(addr("10.0.0.2"), true).await.unwrap();
        assert_eq!(network.mutation_count(), 1);
        assert!(network.is_reachable(addr("10.0.0.2")));

        network.set_reachable(addr("10.0.0.2"), false).await.unwrap();
        network.set_reachable(addr("10.0.0.2"), false).await.unwrap();
        assert_eq!(network.mutation_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let network = MemoryNetwork::new();
        network.fail_next(2);
        assert!(network.set_reachable(addr("10.0.0.2"), true).await.is_err());
        assert!(network.set_reachable(addr("10.0.0.2"), true).await.is_err());
        assert!(network.set_reachable(addr("10.0.0.2"), true).await.is_ok());
    }

    #[tokio::test]
    async fn test_query_reachable_sees_manual_edits() {
        let network = MemoryNetwork::new();
        assert!(!network.query_reachable(addr("10.0.0.2")).await.unwrap());
        network.tamper_reachable(addr("10.0.0.2"), true);
        assert!(network.query_reachable(addr("10.0.0.2")).await.unwrap());

        // Reads are not subject to injected failures.
        network.set_failing(true);
        assert!(network.query_reachable(addr("10.0.0.2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_missing_peer_is_ok() {
        let network = MemoryNetwork::with_peers([addr("10.0.0.2")]);
        network.remove_peer(addr("10.0.0.9")).await.unwrap();
        network.remove_peer(addr("10.0.0.2")).await.unwrap();
        assert!(network.list_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_clears_allow_list() {
        let network = MemoryNetwork::with_peers([addr("10.0.0.2")]);
        network.setup().await.unwrap();
        network.set_reachable(addr("10.0.0.2"), true).await.unwrap();
        network.teardown().await.unwrap();
        assert!(!network.is_installed());
        assert!(network.list_reachable().await.unwrap().is_empty());
        assert!(network.has_peer(addr("10.0.0.2")));
    }
}
