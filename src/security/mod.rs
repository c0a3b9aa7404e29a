// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Concurrency primitives shared by the gateway core.

pub mod locks;

pub use locks::{resilient_lock, resilient_read, resilient_write, DeviceGuard, DeviceLocks};
