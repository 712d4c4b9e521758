// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PLX internal register access routing.
//!
//! Two access protocols exist. The 8111/8112 bridges expose an index/data
//! window in configuration space; every other supported chip maps its
//! registers behind BAR 0 of its register-access node, with per-port
//! offset adjustment on top.

use crate::chip::ChipFamily;
use crate::chip::RegProtocol;
use crate::device::ChipMode;
use crate::device::DeviceList;
use crate::device::NodeId;
use crate::pci::find_capability;
use crate::pci::PCI_CAP_ID_PCI_EXPRESS;
use crate::Error;
use crate::Result;

/// Index/data window registers of the 8111/8112 bridges.
const REG_8111_INDEX: u32 = 0x84;
const REG_8111_DATA: u32 = 0x88;

/// Window of internal registers reachable through the 8111 index register.
const REG_8111_WINDOW_FIRST: u32 = 0x1000;
const REG_8111_WINDOW_LAST: u32 = 0x1064;

/// Draco-1 offsets that hang the chip when accessed; reads return 0 and
/// writes are dropped.
const DRACO_1_DEAD_OFFSETS: [u64; 4] = [0x856c, 0x8570, 0x1056c, 0x10570];

impl DeviceList {
    /// Reads a PLX internal register.
    pub fn plx_reg_read(&self, id: NodeId, offset: u32, adjust_for_port: bool) -> Result<u32> {
        match self.node(id).key.chip.descriptor().reg_protocol {
            RegProtocol::IndexedWindow => self.indexed_read(id, offset),
            RegProtocol::MemoryMapped => self.mapped_access(id, offset, adjust_for_port, None),
            RegProtocol::None => Err(Error::Unsupported),
        }
    }

    /// Writes a PLX internal register.
    pub fn plx_reg_write(
        &self,
        id: NodeId,
        offset: u32,
        value: u32,
        adjust_for_port: bool,
    ) -> Result<()> {
        match self.node(id).key.chip.descriptor().reg_protocol {
            RegProtocol::IndexedWindow => self.indexed_write(id, offset, value),
            RegProtocol::MemoryMapped => self
                .mapped_access(id, offset, adjust_for_port, Some(value))
                .map(|_| ()),
            RegProtocol::None => Err(Error::Unsupported),
        }
    }

    fn indexed_read(&self, id: NodeId, offset: u32) -> Result<u32> {
        if !(REG_8111_WINDOW_FIRST..=REG_8111_WINDOW_LAST).contains(&offset) {
            return Err(Error::InvalidOffset);
        }
        let cfg = self.node(id).config();

        // Save the current index around the transaction.
        let saved = cfg.read_u32(REG_8111_INDEX);
        cfg.write_u32(REG_8111_INDEX, offset - REG_8111_WINDOW_FIRST);
        let value = cfg.read_u32(REG_8111_DATA);
        cfg.write_u32(REG_8111_INDEX, saved);
        Ok(value)
    }

    fn indexed_write(&self, id: NodeId, offset: u32, value: u32) -> Result<()> {
        if !(REG_8111_WINDOW_FIRST..=REG_8111_WINDOW_LAST).contains(&offset) {
            return Err(Error::InvalidOffset);
        }
        let cfg = self.node(id).config();

        let saved = cfg.read_u32(REG_8111_INDEX);
        cfg.write_u32(REG_8111_INDEX, offset - REG_8111_WINDOW_FIRST);
        cfg.write_u32(REG_8111_DATA, value);
        cfg.write_u32(REG_8111_INDEX, saved);
        Ok(())
    }

    /// Memory-mapped access through the register node's BAR 0. A `value`
    /// of `Some` performs a write; `None` performs a read.
    fn mapped_access(
        &self,
        id: NodeId,
        offset: u32,
        adjust_for_port: bool,
        value: Option<u32>,
    ) -> Result<u32> {
        let reg_node = self.resolve_reg_node(id)?;
        let io = self.map_bar(reg_node, 0)?;

        let mut offset = u64::from(offset);
        if adjust_for_port {
            offset += self.port_offset_adjustment(id);
        }

        if offset + 4 > io.len() {
            return Err(Error::InvalidOffset);
        }

        let node = self.node(id);
        if node.key.chip.family == ChipFamily::Draco1 && DRACO_1_DEAD_OFFSETS.contains(&offset) {
            return Ok(0);
        }

        match value {
            Some(value) => {
                io.write_u32(offset, value);
                Ok(value)
            }
            None => Ok(io.read_u32(offset)),
        }
    }

    /// Byte adjustment applied to port-relative register offsets.
    pub(crate) fn port_offset_adjustment(&self, id: NodeId) -> u64 {
        let node = self.node(id);

        if node.key.port_type.is_nt() {
            return u64::from(node.nt_reg_base);
        }

        // Mira enhanced-mode USB EP registers start at 0, not at the
        // port-3 block the arithmetic would select.
        if node.key.chip.family == ChipFamily::Mira
            && node.key.mode == ChipMode::Enhanced
            && node.header_type == 0
            && self.port_number_of(id) == 3
        {
            return 0;
        }

        let port = u64::from(self.port_number_of(id));
        port * 4096 + u64::from(node.key.chip.descriptor().port_reg_extra_base)
    }

    /// Port number for offset adjustment, discovered lazily from the PCIe
    /// link capability when the topology pass has not resolved it yet.
    fn port_number_of(&self, id: NodeId) -> u8 {
        let node = self.node(id);
        if let Some(port) = node.port_number.get() {
            return *port;
        }
        let cfg = node.config();
        let cap = find_capability(cfg, PCI_CAP_ID_PCI_EXPRESS, false, 0);
        let port = if cap == 0 {
            // No PCIe capability; default to port 0.
            0
        } else {
            (cfg.read_u32(u32::from(cap) + 0x0c) >> 24) as u8
        };
        let _ = node.port_number.set(port);
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_8111;
    use crate::fake::fake_switch;
    use crate::pci::PciAddress;

    #[test]
    fn adjusted_access_targets_port_block() {
        let (backend, ram) = fake_switch();
        let list = DeviceList::scan(backend).unwrap();
        let ds = list
            .find(
                &KeyMatch {
                    bus: Some(1),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        // The fake downstream port is port number 2.
        list.plx_reg_write(ds, 0x240, 0xdead_beef, true).unwrap();
        assert_eq!(ram.peek(2 * 4096 + 0x240), 0xdead_beef);
        assert_eq!(list.plx_reg_read(ds, 0x240, true).unwrap(), 0xdead_beef);

        // Unadjusted access uses the raw offset.
        list.plx_reg_write(ds, 0x240, 0x1234_5678, false).unwrap();
        assert_eq!(ram.peek(0x240), 0x1234_5678);
    }

    #[test]
    fn atlas_ports_sit_above_the_family_base() {
        use std::sync::Arc;

        use crate::fake::FakeBackend;
        use crate::fake::FakeBarRam;
        use crate::fake::FakeConfig;

        let backend = Arc::new(FakeBackend::new());
        // Atlas port registers start 8 MiB into BAR 0.
        let ram = FakeBarRam::new(0x100_0000);
        let mut cfg = FakeConfig::new(0x1000, 0xc010);
        cfg.set_header_type(1);
        cfg.set_class(0x060400);
        cfg.set_bar(0, 0xe000_0000);
        cfg.add_pcie_cap(6, 2, 16, 4);
        cfg.add_ext_vsec(0xc010, 0xb0);
        backend.add_function(
            PciAddress {
                domain: 0,
                bus: 0,
                dev: 0,
                func: 0,
            },
            cfg,
            Some(ram.clone()),
        );

        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        assert_eq!(list.node(id).key.chip.family, ChipFamily::Atlas);

        list.plx_reg_write(id, 0x240, 0x7777_0001, true).unwrap();
        assert_eq!(ram.peek(0x80_0000 + 2 * 4096 + 0x240), 0x7777_0001);
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        let (backend, _ram) = fake_switch();
        let list = DeviceList::scan(backend).unwrap();
        let up = list.find(&KeyMatch::default(), 0).unwrap();
        assert!(matches!(
            list.plx_reg_read(up, 0x4000_0000, false),
            Err(Error::InvalidOffset)
        ));
    }

    #[test]
    fn indexed_window_round_trips_and_restores_index() {
        let (backend, _eeprom) = fake_8111();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        let node = list.node(id);

        // Seed the index register to verify it is restored afterward.
        node.config().write_u32(0x84, 0x30);

        list.plx_reg_write(id, 0x1010, 0xa5a5_0000, false).unwrap();
        assert_eq!(list.plx_reg_read(id, 0x1010, false).unwrap(), 0xa5a5_0000);
        assert_eq!(node.config().read_u32(0x84), 0x30);

        // Offsets outside the window never touch the index register.
        assert!(matches!(
            list.plx_reg_read(id, 0xffc, false),
            Err(Error::InvalidOffset)
        ));
        assert!(matches!(
            list.plx_reg_read(id, 0x1068, false),
            Err(Error::InvalidOffset)
        ));
    }

    #[test]
    fn unsupported_chip_is_refused() {
        let (backend, _ram) = fake_switch();
        // Add a non-PLX function.
        let cfg = crate::fake::FakeConfig::new(0x1af4, 0x1000);
        backend.add_function(
            PciAddress {
                domain: 0,
                bus: 3,
                dev: 0,
                func: 0,
            },
            cfg,
            None,
        );
        let list = DeviceList::scan(backend).unwrap();
        let other = list
            .find(
                &KeyMatch {
                    vendor_id: Some(0x1af4),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        assert!(matches!(
            list.plx_reg_read(other, 0x0, false),
            Err(Error::Unsupported)
        ));
    }
}
