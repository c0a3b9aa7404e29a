// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON file device store.
//!
//! Devices live in a single pretty-printed JSON document. Every mutation
//! runs as a read-modify-write transaction under an exclusive advisory lock
//! on a sibling `.lock` file, and the new document replaces the old one by
//! atomic rename. A crash or failed write therefore never leaves a record
//! half-updated, and compare-and-set holds across processes (the CLI and
//! the daemon may both open the same file).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::DeviceStore;
use crate::error::StoreError;
use crate::types::{Device, DeviceAddress};

/// Default timeout for acquiring the file lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while the lock is held elsewhere
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    devices: Vec<Device>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: None,
            devices: Vec::new(),
        }
    }
}

impl StoreDocument {
    fn find_mut(&mut self, address: DeviceAddress) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.address == address)
    }
}

/// Device store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonFileStore {
    /// Open a store, creating parent directories and verifying any existing
    /// document parses. Fails if the store cannot be used at all.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        };
        if let Some(parent) = store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        store.read_document()?;
        tracing::info!(path = %store.path.display(), "Opened device store");
        Ok(store)
    }

    /// Override the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock_file(&self) -> Result<File, StoreError> {
        let lock_path = self.lock_path();
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {}", lock_path.display(), e)))
    }

    fn acquire(&self, exclusive: bool) -> Result<File, StoreError> {
        let lock_file = self.open_lock_file()?;
        let start = Instant::now();
        loop {
            // Trait-qualified: std's inherent `File::try_lock_shared` has a different error type.
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&lock_file)
            } else {
                FileExt::try_lock_shared(&lock_file)
            };
            match attempt {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(StoreError::Unavailable(format!(
                            "timed out after {:?} waiting for lock on {}",
                            self.lock_timeout,
                            self.path.display()
                        )));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "cannot lock {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        }
    }

    fn read_document(&self) -> Result<StoreDocument, StoreError> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Unavailable(format!("cannot read {}: {}", self.path.display(), e)))?;
        if content.trim().is_empty() {
            return Ok(StoreDocument::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))
    }

    fn write_document(&self, doc: &mut StoreDocument) -> Result<(), StoreError> {
        doc.updated_at = Some(Utc::now());
        doc.devices.sort_by_key(|d| d.address);

        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Corrupt(format!("cannot serialize devices: {}", e)))?;

        let temp_path = self.path.with_extension("tmp");
        let io_err = |e: std::io::Error| {
            StoreError::Unavailable(format!("cannot write {}: {}", temp_path.display(), e))
        };
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .map_err(io_err)?;
            temp_file.write_all(content.as_bytes()).map_err(io_err)?;
            temp_file.sync_all().map_err(io_err)?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            StoreError::Unavailable(format!(
                "cannot replace {} with {}: {}",
                self.path.display(),
                temp_path.display(),
                e
            ))
        })
    }

    /// Shared-locked read.
    fn read<R>(&self, f: impl FnOnce(&StoreDocument) -> R) -> Result<R, StoreError> {
        let _lock = self.acquire(false)?;
        let doc = self.read_document()?;
        Ok(f(&doc))
    }

    /// Exclusive read-modify-write. `f` returns its result and whether the
    /// document changed; unchanged documents are not rewritten.
    fn transact<R>(&self, f: impl FnOnce(&mut StoreDocument) -> (R, bool)) -> Result<R, StoreError> {
        let _lock = self.acquire(true)?;
        let mut doc = self.read_document()?;
        let (result, changed) = f(&mut doc);
        if changed {
            self.write_document(&mut doc)?;
        }
        Ok(result)
    }
}

impl DeviceStore for JsonFileStore {
    fn get(&self, address: DeviceAddress) -> Result<Option<Device>, StoreError> {
        self.read(|doc| doc.devices.iter().find(|d| d.address == address).cloned())
    }

    fn list(&self) -> Result<Vec<Device>, StoreError> {
        self.read(|doc| {
            let mut devices = doc.devices.clone();
            devices.sort_by_key(|d| d.address);
            devices
        })
    }

    fn insert(&self, device: Device) -> Result<(), StoreError> {
        self.transact(|doc| {
            match doc.find_mut(device.address) {
                Some(existing) => *existing = device,
                None => doc.devices.push(device),
            }
            ((), true)
        })
    }

    fn set_attempts(&self, address: DeviceAddress, attempts: u32) -> Result<bool, StoreError> {
        self.transact(|doc| match doc.find_mut(address) {
            Some(device) => {
                let changed = device.attempts != attempts;
                device.attempts = attempts;
                (true, changed)
            }
            None => (false, false),
        })
    }

    fn compare_and_set_attempts(
        &self,
        address: DeviceAddress,
        expected: u32,
        new: u32,
    ) -> Result<Option<u32>, StoreError> {
        self.transact(|doc| match doc.find_mut(address) {
            Some(device) => {
                let current = device.attempts;
                if current == expected && current != new {
                    device.attempts = new;
                    (Some(current), true)
                } else {
                    (Some(current), false)
                }
            }
            None => (None, false),
        })
    }

    fn delete(&self, address: DeviceAddress) -> Result<bool, StoreError> {
        self.transact(|doc| {
            let before = doc.devices.len();
            doc.devices.retain(|d| d.address != address);
            let removed = doc.devices.len() != before;
            (removed, removed)
        })
    }
}
