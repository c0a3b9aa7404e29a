// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! wag - zero-trust access gateway for WireGuard
//!
//! Decides per device whether its traffic may leave the tunnel for the
//! protected network, based on the device's MFA state, and keeps the live
//! firewall/peer configuration in step with that decision.
//!
//! # Core Modules
//!
//! - [`authz`] - Device authorization state machine
//! - [`enforcement`] - Applies authorization decisions to the network layer
//! - [`session`] - Authenticated sessions and idle expiry
//! - [`gateway`] - Per-device serialized entry point tying the above together
//! - [`control`] - Unix-socket control plane (protocol, server, client)
//! - [`background`] - Scheduled expiry sweep and reconciliation
//! - [`store`] - Device persistence
//! - [`network`] - WireGuard peer table and forwarding rules
//! - [`audit`] - Audit log of authorization events
//! - [`error`] - Error taxonomy shared by every layer
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wag::{AuditLogger, Config, Device, Gateway, MemoryNetwork, MemoryStore};
//!
//! # async fn example() -> Result<(), wag::GatewayError> {
//! let address = "10.0.0.2".parse()?;
//! let store = Arc::new(MemoryStore::with_devices([Device::new(address, "alice", "pk=")]));
//! let gateway = Gateway::new(
//!     &Config::default(),
//!     store,
//!     Arc::new(MemoryNetwork::new()),
//!     Arc::new(AuditLogger::in_memory()),
//! );
//!
//! gateway.setup_network().await?;
//! gateway.reconcile().await?;
//! gateway.record_success(address, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod authz;
pub mod background;
pub mod config;
pub mod control;
pub mod enforcement;
pub mod error;
pub mod gateway;
pub mod network;
pub mod security;
pub mod session;
pub mod store;
pub mod types;

pub use audit::{AuditEntry, AuditLogger};
pub use authz::StateMachine;
pub use background::BackgroundTasks;
pub use config::Config;
pub use control::{Command, ControlClient, ControlError, ControlServer, Request, Response};
pub use enforcement::{Correction, Enforcer};
pub use error::{ErrorKind, GatewayError, GatewayResult, NetworkError, StoreError};
pub use gateway::{Gateway, ReconcileReport, SweepReport};
pub use network::{MemoryNetwork, NetworkLayer, SystemNetwork};
pub use session::{SessionSnapshot, SessionTracker};
pub use store::{DeviceStore, JsonFileStore, MemoryStore};
pub use types::{AuthorizationState, Device, DeviceAddress};
