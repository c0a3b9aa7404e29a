// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory device store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use super::DeviceStore;
use crate::error::StoreError;
use crate::security::{resilient_read, resilient_write};
use crate::types::{Device, DeviceAddress};

/// Device store held entirely in process memory.
///
/// Used by tests and by deployments that seed devices at startup. Can be
/// flipped unavailable to exercise store-failure paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<DeviceAddress, Device>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let store = Self::new();
        {
            let mut map = resilient_write(&store.devices);
            for device in devices {
                map.insert(device.address, device);
            }
        }
        store
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DeviceStore for MemoryStore {
    fn get(&self, address: DeviceAddress) -> Result<Option<Device>, StoreError> {
        self.check()?;
        Ok(resilient_read(&self.devices).get(&address).cloned())
    }

    fn list(&self) -> Result<Vec<Device>, StoreError> {
        self.check()?;
        Ok(resilient_read(&self.devices).values().cloned().collect())
    }

    fn insert(&self, device: Device) -> Result<(), StoreError> {
        self.check()?;
        resilient_write(&self.devices).insert(device.address, device);
        Ok(())
    }

    fn set_attempts(&self, address: DeviceAddress, attempts: u32) -> Result<bool, StoreError> {
        self.check()?;
        match resilient_write(&self.devices).get_mut(&address) {
            Some(device) => {
                device.attempts = attempts;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn compare_and_set_attempts(
        &self,
        address: DeviceAddress,
        expected: u32,
        new: u32,
    ) -> Result<Option<u32>, StoreError> {
        self.check()?;
        let mut devices = resilient_write(&self.devices);
        let Some(device) = devices.get_mut(&address) else {
            return Ok(None);
        };
        let current = device.attempts;
        if current == expected {
            device.attempts = new;
        }
        Ok(Some(current))
    }

    fn delete(&self, address: DeviceAddress) -> Result<bool, StoreError> {
        self.check()?;
        Ok(resilient_write(&self.devices).remove(&address).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(addr: &str) -> Device {
        Device::new(addr.parse().unwrap(), "alice", "pk")
    }

    #[test]
    fn test_crud() {
        let store = MemoryStore::with_devices([device("10.0.0.2")]);
        let addr: DeviceAddress = "10.0.0.2".parse().unwrap();

        assert!(store.get(addr).unwrap().is_some());
        assert!(store.set_attempts(addr, 3).unwrap());
        assert_eq!(store.get(addr).unwrap().unwrap().attempts, 3);
        assert!(store.delete(addr).unwrap());
        assert!(!store.delete(addr).unwrap());
        assert!(store.get(addr).unwrap().is_none());
        assert!(!store.set_attempts(addr, 1).unwrap());
    }

    #[test]
    fn test_compare_and_set() {
        let store = MemoryStore::with_devices([device("10.0.0.2")]);
        let addr: DeviceAddress = "10.0.0.2".parse().unwrap();

        assert_eq!(store.compare_and_set_attempts(addr, 0, 1).unwrap(), Some(0));
        // Stale expectation: no write, current value reported back.
        assert_eq!(store.compare_and_set_attempts(addr, 0, 5).unwrap(), Some(1));
        assert_eq!(store.get(addr).unwrap().unwrap().attempts, 1);

        let missing: DeviceAddress = "10.0.0.9".parse().unwrap();
        assert_eq!(store.compare_and_set_attempts(missing, 0, 1).unwrap(), None);
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryStore::with_devices([device("10.0.0.2")]);
        store.set_unavailable(true);
        assert!(matches!(store.list(), Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
