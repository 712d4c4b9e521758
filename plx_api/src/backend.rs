// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware abstraction consumed by the device list.
//!
//! [`crate::sysfs::SysfsBackend`] implements this over Linux sysfs;
//! [`crate::fake::FakeBackend`] implements it over an in-memory switch
//! model for tests and demos.

use std::sync::Arc;

use crate::pci::ConfigAccess;
use crate::pci::PciAddress;
use crate::Result;

/// One function found by a bus scan.
pub struct PciFunctionInfo {
    pub address: PciAddress,
    pub config: Arc<dyn ConfigAccess>,
}

/// 32-bit volatile access to a memory-mapped BAR region.
pub trait RegisterIo: Send + Sync {
    /// Size of the mapped region in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the 32-bit register at `offset` bytes into the region.
    fn read_u32(&self, offset: u64) -> u32;

    /// Writes the 32-bit register at `offset` bytes into the region.
    fn write_u32(&self, offset: u64, value: u32);
}

/// Host glue for enumerating PCI functions and reaching their BARs.
pub trait PciBackend: Send + Sync {
    /// Enumerates every visible PCI function.
    fn scan(&self) -> Result<Vec<PciFunctionInfo>>;

    /// Returns `(physical_address, size)` of a BAR region, if the host
    /// knows it. BARs the host has not assigned resources for yield `None`.
    fn bar_region(&self, address: PciAddress, bar: usize) -> Option<(u64, u64)>;

    /// Maps a BAR region for register access.
    fn map_bar(&self, address: PciAddress, bar: usize) -> Result<Arc<dyn RegisterIo>>;
}
