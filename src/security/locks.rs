// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers for the gateway core.
//!
//! Two kinds of locking live here:
//!
//! - Poison-resilient accessors for the short, synchronous critical
//!   sections around in-memory tables (session map, memory store). A
//!   panic in one control connection must not take the whole gateway down
//!   with a poisoned lock, so we log and recover the guard.
//! - [`DeviceLocks`], the per-device serialization point. Every transition,
//!   enforcement change and reconcile step for an address runs while
//!   holding that address's guard. Waiters are admitted in FIFO order, which
//!   is what gives per-device ordering of store commits and enforcement.
//!
//! ## Usage
//!
//! ```no_run
//! use wag::security::locks::DeviceLocks;
//!
//! # async fn example() {
//! let locks = DeviceLocks::new();
//! let addr = "10.0.0.2".parse().unwrap();
//! let _guard = locks.acquire(addr).await;
//! // mutate store, then apply enforcement
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::DeviceAddress;

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; recovering. A task panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; recovering. A task panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex poisoned; recovering. A task panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Held for the duration of one device's critical section.
#[derive(Debug)]
pub struct DeviceGuard {
    address: DeviceAddress,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl DeviceGuard {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

/// Table of per-device async mutexes.
///
/// Entries are created on first use and dropped by [`DeviceLocks::prune`]
/// once nobody holds or waits on them.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    table: Mutex<HashMap<DeviceAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `address`.
    pub async fn acquire(&self, address: DeviceAddress) -> DeviceGuard {
        let slot = {
            let mut table = resilient_lock(&self.table);
            Arc::clone(table.entry(address).or_default())
        };
        let guard = slot.lock_owned().await;
        DeviceGuard {
            address,
            _guard: guard,
        }
    }

    /// Drop idle entries. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut table = resilient_lock(&self.table);
        let before = table.len();
        // The table holds one reference; anything above that is a holder or waiter.
        table.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - table.len()
    }

    pub fn len(&self) -> usize {
        resilient_lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
