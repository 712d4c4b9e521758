// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! User-space service core for PLX/Broadcom PCI and PCIe switch chips.
//!
//! The crate enumerates PCI functions through a [`backend::PciBackend`],
//! resolves which of the ~40 PLX chip variants each function is, and exposes
//! the chip-specific operations on top of that identity: internal register
//! access, EEPROM access with CRC, PCIe port topology and properties,
//! hardware performance counters, and multi-host virtual-switch management.

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use crate::backend::PciBackend;
pub use crate::backend::PciFunctionInfo;
pub use crate::backend::RegisterIo;
pub use crate::chip::ChipFamily;
pub use crate::chip::ChipIdentity;
pub use crate::device::BarProperties;
pub use crate::device::ChipMode;
pub use crate::device::DeviceKey;
pub use crate::device::DeviceList;
pub use crate::device::DeviceNode;
pub use crate::device::NodeId;
pub use crate::device::PciePortType;
pub use crate::device::PortProperties;
pub use crate::device::PortType;
pub use crate::multi_host::MultiHostProperties;
pub use crate::pci::ConfigAccess;
pub use crate::pci::PciAddress;
pub use crate::perf::PerfProperties;

pub mod backend;
pub mod chip;
pub mod device;
pub mod eeprom;
pub mod fake;
pub mod multi_host;
pub mod pci;
pub mod perf;
pub mod reg;
pub mod sysfs;

/// Flat status codes shared by every operation in the crate.
///
/// Probe and detection paths never surface these; they fall back to an
/// "unknown"/"none" answer so that one misbehaving function cannot abort
/// enumeration of the rest of the bus.
#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("memory allocation or BAR mapping failed")]
    InsufficientResources,
    #[error("invalid access type or state for this operation")]
    InvalidAccess,
    #[error("address is misaligned or out of range")]
    InvalidAddress,
    #[error("input data rejected before touching hardware")]
    InvalidData,
    #[error("index is out of range")]
    InvalidIndex,
    #[error("lookup of a list object failed")]
    InvalidObject,
    #[error("offset is misaligned or exceeds the valid range")]
    InvalidOffset,
    #[error("size is misaligned or out of range")]
    InvalidSize,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no device matched the requested key")]
    NotFound,
    #[error("polling budget exhausted waiting on hardware")]
    Timeout,
    #[error("operation not supported on this chip or family")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, Error>;

/// EEPROM state as reported (or probed) from a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EepromStatus {
    /// No EEPROM is connected.
    None,
    /// An EEPROM is connected and its contents are valid.
    Valid,
    /// An EEPROM is connected but the device reports a CRC error.
    CrcError,
    /// An EEPROM is connected but its contents are blank or invalid.
    InvalidData,
}

/// Validity of the EEPROM CRC as reported by the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CrcStatus {
    Valid,
    Invalid,
    Unsupported,
}
