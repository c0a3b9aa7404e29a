// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Audit log of authorization events.
//!
//! Every committed transition, grant/revoke and reconcile correction is
//! recorded. Entries are kept in a bounded in-memory ring and, when a path
//! is configured, appended to a file.
//!
//! Log format:
//! `2025-01-15 10:23:45 | LOCKOUT | 10.0.0.2 | attempts=5`

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::security::{resilient_read, resilient_write};
use crate::types::DeviceAddress;

/// Entries kept in memory
const DEFAULT_CAPACITY: usize = 10_000;

/// Longest detail written to one line
const DETAIL_MAX_LENGTH: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Upper-case event name, e.g. `ADMIN_LOCK`
    pub event: String,
    /// Device concerned, if any
    pub address: Option<DeviceAddress>,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(event: impl Into<String>, address: Option<DeviceAddress>, detail: impl AsRef<str>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            address,
            detail: clean_detail(detail.as_ref(), DETAIL_MAX_LENGTH),
        }
    }

    /// Format as a log line
    pub fn to_log_line(&self) -> String {
        let local_time: DateTime<Local> = self.timestamp.into();
        let address = self
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} | {} | {} | {}",
            local_time.format("%Y-%m-%d %H:%M:%S"),
            self.event,
            address,
            self.detail
        )
    }
}

/// Collapse whitespace so one entry is one line, and cap the length.
fn clean_detail(detail: &str, max_len: usize) -> String {
    let cleaned = detail.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() <= max_len {
        cleaned
    } else {
        let truncated: String = cleaned.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[derive(Debug)]
pub struct AuditLogger {
    log_path: Option<PathBuf>,
    capacity: usize,
    recent_entries: RwLock<VecDeque<AuditEntry>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl AuditLogger {
    /// Keep entries in memory only.
    pub fn in_memory() -> Self {
        Self {
            log_path: None,
            capacity: DEFAULT_CAPACITY,
            recent_entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Also append every entry to `path`, creating parent directories.
    pub fn with_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            log_path: Some(path),
            ..Self::in_memory()
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Record an entry. File failures are logged, never returned: an
    /// unwritable audit file must not fail an authorization change that
    /// has already committed.
    pub fn log(&self, entry: AuditEntry) {
        tracing::info!(target: "audit", "{}", entry.to_log_line());

        if let Some(path) = &self.log_path {
            if let Err(e) = append_line(path, &entry.to_log_line()) {
                tracing::warn!(
                    target: "audit",
                    path = %path.display(),
                    error = %e,
                    "Failed to append audit entry"
                );
            }
        }

        let mut recent = resilient_write(&self.recent_entries);
        recent.push_back(entry);
        while recent.len() > self.capacity {
            recent.pop_front();
        }
    }

    pub fn record(&self, event: impl Into<String>, address: Option<DeviceAddress>, detail: impl AsRef<str>) {
        self.log(AuditEntry::new(event, address, detail));
    }

    /// Get recent entries from memory, oldest first
    pub fn recent_entries(&self) -> Vec<AuditEntry> {
        resilient_read(&self.recent_entries).iter().cloned().collect()
    }

    /// Recent entries for one device.
    pub fn entries_for(&self, address: DeviceAddress) -> Vec<AuditEntry> {
        resilient_read(&self.recent_entries)
            .iter()
            .filter(|e| e.address == Some(address))
            .cloned()
            .collect()
    }

    /// Read all lines from the log file
    pub fn read_all_entries(&self) -> Result<Vec<String>> {
        let Some(path) = &self.log_path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(content.lines().map(String::from).collect())
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}
