// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network layer: the live peer table and forwarding allow-list.
//!
//! The enforcement synchronizer is the only caller that mutates this layer.
//! Every mutating call is idempotent: applying the same desired state twice
//! must succeed and leave the underlying configuration untouched.

pub mod memory;
pub mod system;

pub use memory::MemoryNetwork;
pub use system::SystemNetwork;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::NetworkError;
use crate::types::DeviceAddress;

#[async_trait]
pub trait NetworkLayer: Send + Sync {
    /// Install global state (chains, hooks). Called once before any grant.
    async fn setup(&self) -> Result<(), NetworkError>;

    /// Allow or deny forwarding for `address`.
    async fn set_reachable(&self, address: DeviceAddress, reachable: bool) -> Result<(), NetworkError>;

    /// Remove the tunnel peer whose allowed-ips contain `address`.
    /// Removing a peer that does not exist is not an error.
    async fn remove_peer(&self, address: DeviceAddress) -> Result<(), NetworkError>;

    /// Addresses of every configured tunnel peer.
    async fn list_peers(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError>;

    /// Addresses currently allowed to forward.
    async fn list_reachable(&self) -> Result<BTreeSet<DeviceAddress>, NetworkError>;

    /// Whether `address` is allowed to forward right now.
    async fn query_reachable(&self, address: DeviceAddress) -> Result<bool, NetworkError> {
        Ok(self.list_reachable().await?.contains(&address))
    }

    /// Release everything [`NetworkLayer::setup`] installed.
    async fn teardown(&self) -> Result<(), NetworkError>;
}
