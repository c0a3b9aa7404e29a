// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Device persistence.
//!
//! The store is the single source of truth for device records. Only the
//! authorization state machine writes `attempts`, and every write is a
//! single atomic operation so a failed call never leaves a half-advanced
//! record behind.

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::types::{Device, DeviceAddress};

/// Narrow CRUD interface over the device store.
///
/// Calls may block (disk, database). The gateway runs them on tokio's
/// blocking pool so a slow call stalls only the device that made it.
pub trait DeviceStore: Send + Sync {
    /// Fetch a device. `Ok(None)` when the address is unknown.
    fn get(&self, address: DeviceAddress) -> Result<Option<Device>, StoreError>;

    /// All devices, ordered by address.
    fn list(&self) -> Result<Vec<Device>, StoreError>;

    /// Insert or replace a device record.
    fn insert(&self, device: Device) -> Result<(), StoreError>;

    /// Unconditionally set the attempt counter. `Ok(false)` if the device does not exist.
    fn set_attempts(&self, address: DeviceAddress, attempts: u32) -> Result<bool, StoreError>;

    /// Set the attempt counter only if it still equals `expected`.
    ///
    /// Returns the value found in the store: equal to `expected` means the
    /// write happened, anything else means the caller lost a race and must
    /// re-read. `Ok(None)` if the device does not exist.
    fn compare_and_set_attempts(
        &self,
        address: DeviceAddress,
        expected: u32,
        new: u32,
    ) -> Result<Option<u32>, StoreError>;

    /// Remove a device. `Ok(false)` if it did not exist.
    fn delete(&self, address: DeviceAddress) -> Result<bool, StoreError>;
}

/// Render the device listing served to the CLI.
pub fn render_device_table(devices: &[Device]) -> String {
    let mut out = String::from(crate::types::DEVICE_CSV_HEADER);
    for device in devices {
        out.push('\n');
        out.push_str(&device.to_csv_row());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_device_table() {
        let devices = vec![
            Device::new("10.0.0.2".parse().unwrap(), "alice", "a="),
            Device::new("10.0.0.3".parse().unwrap(), "bob", "b=").with_enforcing_mfa(false),
        ];
        let table = render_device_table(&devices);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "username,address,publickey,enforcingmfa,authattempts");
        assert_eq!(lines[1], "alice,10.0.0.2,a=,true,0");
        assert_eq!(lines[2], "bob,10.0.0.3,b=,false,0");
    }
}
