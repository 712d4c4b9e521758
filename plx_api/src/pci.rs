// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PCI configuration-space access and capability traversal.

use std::fmt;
use std::fmt::Display;

use serde::Deserialize;
use serde::Serialize;

/// Value returned by a failed configuration read (master abort).
pub const PCI_CFG_RD_ERR_VAL: u32 = 0xffff_ffff;

pub const PCI_REG_DEV_VEN_ID: u32 = 0x00;
pub const PCI_REG_CMD_STAT: u32 = 0x04;
pub const PCI_REG_CLASS_REV: u32 = 0x08;
pub const PCI_REG_HDR_CACHE_LN: u32 = 0x0c;
pub const PCI_REG_BAR_0: u32 = 0x10;
pub const PCI_REG_T1_PRIM_SEC_BUS: u32 = 0x18;
pub const PCI_REG_TO_SUBSYS_ID: u32 = 0x2c;
pub const PCI_REG_CAP_PTR: u32 = 0x34;
pub const PCI_REG_INT_PIN_LINE: u32 = 0x3c;

pub const PCI_CAP_ID_VPD: u16 = 0x03;
pub const PCI_CAP_ID_VENDOR_SPECIFIC: u16 = 0x09;
pub const PCI_CAP_ID_BRIDGE_SUB_ID: u16 = 0x0d;
pub const PCI_CAP_ID_PCI_EXPRESS: u16 = 0x10;
pub const PCIE_CAP_ID_VENDOR_SPECIFIC: u16 = 0x000b;

/// First PCIe extended capability lives at this config offset.
pub const PCIE_EXT_CAP_BASE: u16 = 0x100;

/// Upper bound on capability-list hops, protecting the walk against
/// malformed or cyclic chains.
const MAX_CAP_PROBES: u32 = 100;

pub const PLX_VENDOR_ID: u16 = 0x10b5;
pub const LSI_VENDOR_ID: u16 = 0x1000;
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// PCI function address, AKA Domain:Bus:Device.Function.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub dev: u8, /* u5 */
    pub func: u8, /* u3 */
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.dev, self.func
        )
    }
}

impl PciAddress {
    /// Parses `[dddd:]bb:dd.f` with hexadecimal components.
    pub fn from_str(address: &str) -> Option<Self> {
        let (dom_bus_dev, func) = address.rsplit_once('.')?;
        let func = u8::from_str_radix(func, 16).ok()?;
        let mut parts = dom_bus_dev.rsplitn(3, ':');
        let dev = u8::from_str_radix(parts.next()?, 16).ok()?;
        let bus = u8::from_str_radix(parts.next()?, 16).ok()?;
        let domain = match parts.next() {
            Some(d) => u16::from_str_radix(d, 16).ok()?,
            None => 0,
        };
        if dev >= 32 || func >= 8 {
            return None;
        }
        Some(PciAddress {
            domain,
            bus,
            dev,
            func,
        })
    }
}

/// Raw access to one function's configuration space.
///
/// Reads of unreachable devices return [`PCI_CFG_RD_ERR_VAL`] rather than
/// failing, mirroring what a PCI master abort returns on real hardware.
pub trait ConfigAccess: Send + Sync {
    fn read_u32(&self, offset: u32) -> u32;

    fn write_u32(&self, offset: u32, value: u32);

    /// Reads a register through a path the host OS cannot have cached.
    ///
    /// Several OSes cache or synthesize reads of the interrupt line/pin
    /// register; the NT-side probe depends on observing the true hardware
    /// value, so backends must route this read around any such cache.
    fn read_u32_uncached(&self, offset: u32) -> u32 {
        self.read_u32(offset)
    }

    fn read_u16(&self, offset: u32) -> u16 {
        let value = self.read_u32(offset & !0x3);
        (value >> ((offset & 0x2) * 8)) as u16
    }

    fn read_u8(&self, offset: u32) -> u8 {
        let value = self.read_u32(offset & !0x3);
        (value >> ((offset & 0x3) * 8)) as u8
    }
}

/// Scans a function's capability list for the base offset of a PCI or PCIe
/// extended capability.
///
/// For vendor-specific capabilities (VSEC) a device may carry several
/// instances; `instance` selects which match to return. The parameter is
/// ignored for any other capability ID. Returns 0 when not found.
pub fn find_capability(cfg: &dyn ConfigAccess, cap_id: u16, pcie_cap: bool, instance: u8) -> u16 {
    // Verify device responds to PCI accesses (in case link down).
    let reg = cfg.read_u32(PCI_REG_CMD_STAT);
    if reg == PCI_CFG_RD_ERR_VAL {
        return 0;
    }

    // Verify device supports extended capabilities (04h[20]).
    if reg & (1 << 20) == 0 {
        return 0;
    }

    let mut instance = instance;
    let mut offset: u16;
    if pcie_cap {
        offset = PCIE_EXT_CAP_BASE;
        if cap_id != PCIE_CAP_ID_VENDOR_SPECIFIC {
            instance = 0;
        }
    } else {
        // First capability offset from the capability pointer (34h[7:0]).
        offset = u16::from(cfg.read_u8(PCI_REG_CAP_PTR));
        if cap_id != PCI_CAP_ID_VENDOR_SPECIFIC {
            instance = 0;
        }
    }

    let mut match_count = 0;
    let mut probes = 0;
    while offset != 0 && probes < MAX_CAP_PROBES {
        let reg = cfg.read_u32(u32::from(offset));
        if reg == 0 || reg == PCI_CFG_RD_ERR_VAL {
            return 0;
        }

        let curr_id = if pcie_cap {
            (reg & 0xffff) as u16
        } else {
            (reg & 0xff) as u16
        };

        if curr_id == cap_id {
            if instance == match_count {
                return offset;
            }
            match_count += 1;
        }

        offset = if pcie_cap {
            ((reg >> 20) & 0xfff) as u16
        } else {
            ((reg >> 8) & 0xff) as u16
        };
        probes += 1;
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeConfig;

    #[test]
    fn address_parse_and_display() {
        let addr = PciAddress::from_str("0000:04:08.3").unwrap();
        assert_eq!(
            addr,
            PciAddress {
                domain: 0,
                bus: 4,
                dev: 8,
                func: 3
            }
        );
        assert_eq!(addr.to_string(), "0000:04:08.3");

        let short = PciAddress::from_str("02:1f.0").unwrap();
        assert_eq!(short.domain, 0);
        assert_eq!(short.bus, 2);
        assert_eq!(short.dev, 0x1f);

        assert!(PciAddress::from_str("02:20.0").is_none());
        assert!(PciAddress::from_str("garbage").is_none());
    }

    #[test]
    fn capability_walk_finds_pcie_cap() {
        let mut cfg = FakeConfig::new(0x10b5, 0x8612);
        let off = cfg.add_pci_cap(PCI_CAP_ID_PCI_EXPRESS as u8, 0x3c);
        assert_eq!(
            find_capability(&cfg, PCI_CAP_ID_PCI_EXPRESS, false, 0),
            off
        );
        assert_eq!(find_capability(&cfg, PCI_CAP_ID_VPD, false, 0), 0);
    }

    #[test]
    fn capability_walk_is_bounded_on_cycles() {
        let mut cfg = FakeConfig::new(0x10b5, 0x8612);
        let off = cfg.add_pci_cap(PCI_CAP_ID_VPD as u8, 8);
        // Point the capability's next pointer back at itself.
        let hdr = cfg.read_u32(u32::from(off));
        cfg.write_u32(u32::from(off), (hdr & !0xff00) | (u32::from(off) << 8));
        // Searching for a different ID must terminate.
        assert_eq!(find_capability(&cfg, PCI_CAP_ID_PCI_EXPRESS, false, 0), 0);
    }

    #[test]
    fn vsec_instance_selection() {
        let mut cfg = FakeConfig::new(0x10b5, 0x8612);
        let first = cfg.add_pci_cap(PCI_CAP_ID_VENDOR_SPECIFIC as u8, 8);
        let second = cfg.add_pci_cap(PCI_CAP_ID_VENDOR_SPECIFIC as u8, 8);
        assert_eq!(
            find_capability(&cfg, PCI_CAP_ID_VENDOR_SPECIFIC, false, 0),
            first
        );
        assert_eq!(
            find_capability(&cfg, PCI_CAP_ID_VENDOR_SPECIFIC, false, 1),
            second
        );
        assert_eq!(
            find_capability(&cfg, PCI_CAP_ID_VENDOR_SPECIFIC, false, 2),
            0
        );
    }
}
