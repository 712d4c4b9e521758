// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Configuration EEPROM access.
//!
//! Three controller generations exist: the 6000-series 16-bit port, the
//! 8111/8112 bit-serial controller, and the 8000-class command/status
//! controller. Dispatch is by the family descriptor; 32-bit access on
//! 16-bit-only controllers is synthesized from two transfers and vice
//! versa.

mod eep_6000;
mod eep_8000;
mod eep_8111;

use log::debug;

use crate::chip::EepromProtocol;
use crate::device::DeviceList;
use crate::device::NodeId;
use crate::CrcStatus;
use crate::EepromStatus;
use crate::Error;
use crate::Result;

impl DeviceList {
    /// Reports the EEPROM state as seen by the device.
    pub fn eeprom_present(&self, id: NodeId) -> Result<EepromStatus> {
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Port6000 => {
                // The 6000 series does not report presence; probe for it.
                if self.eeprom_probe(id)? {
                    Ok(EepromStatus::Valid)
                } else {
                    Ok(EepromStatus::None)
                }
            }
            EepromProtocol::BitSerial8111 => eep_8111::present(self, id),
            EepromProtocol::Ctrl8000 => eep_8000::present(self, id),
            EepromProtocol::None => Err(Error::Unsupported),
        }
    }

    /// Probes for an EEPROM by writing the complement of a scratch
    /// location and reading it back. The original value is restored.
    pub fn eeprom_probe(&self, id: NodeId) -> Result<bool> {
        let node = self.node(id);
        let chip = node.key.chip.chip;

        // Probe offsets sit outside the functional region, or just past
        // the CRC where one exists.
        let grouped = match chip & 0xff00 {
            0x2300 | 0x3300 | 0x8600 | 0x8700 => chip & 0xff00,
            _ => chip,
        };
        let probe_offset: u32 = match grouped {
            0x6150 | 0x6152 | 0x6154 | 0x6156 | 0x6254 | 0x6350 | 0x6520 | 0x6540 => 0x50,
            0x8114 => {
                if node.key.chip.revision >= 0xba {
                    0x3ec + 4
                } else {
                    0x378 + 4
                }
            }
            0x8508 | 0x8512 | 0x8517 | 0x8518 => 0x78f * 4 + 4,
            0x8516 | 0x8524 | 0x8532 => 0xbe4 * 4 + 4,
            0x2300 | 0x3300 | 0x8111 | 0x8112 | 0x8505 | 0x8509 | 0x8525 | 0x8533 | 0x8547
            | 0x8548 | 0x8600 | 0x8700 => 0x10,
            _ => return Err(Error::Unsupported),
        };

        debug!("probe EEPROM at offset {:02X}h", probe_offset);

        let original = self.eeprom_read_u32(id, probe_offset)?;
        let inverse = !original;
        self.eeprom_write_u32(id, probe_offset, inverse)?;
        let readback = self.eeprom_read_u32(id, probe_offset)?;

        let present = readback == inverse;
        // Restore the scratch location whatever the probe decided.
        self.eeprom_write_u32(id, probe_offset, original)?;
        Ok(present)
    }

    /// Returns the EEPROM byte-address width (1, 2, or 3).
    pub fn eeprom_address_width(&self, id: NodeId) -> Result<u8> {
        let width = match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::BitSerial8111 => eep_8111::address_width(self, id)?,
            EepromProtocol::Ctrl8000 => eep_8000::address_width(self, id)?,
            _ => return Err(Error::Unsupported),
        };
        debug!("EEPROM address width = {}B", width);
        Ok(width)
    }

    /// Overrides the EEPROM byte-address width.
    pub fn eeprom_set_address_width(&self, id: NodeId, width: u8) -> Result<()> {
        if !(1..=3).contains(&width) {
            return Err(Error::InvalidData);
        }
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::BitSerial8111 => eep_8111::set_address_width(self, id, width),
            EepromProtocol::Ctrl8000 => eep_8000::set_address_width(self, id, width),
            _ => Err(Error::Unsupported),
        }
    }

    /// Reads the CRC stored in the EEPROM along with its validity.
    pub fn eeprom_crc(&self, id: NodeId) -> Result<(u32, CrcStatus)> {
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Ctrl8000 => eep_8000::crc_get(self, id),
            _ => Err(Error::Unsupported),
        }
    }

    /// Recomputes the EEPROM CRC, optionally writing it back.
    pub fn eeprom_crc_update(&self, id: NodeId, update_eeprom: bool) -> Result<u32> {
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Ctrl8000 => eep_8000::crc_update(self, id, update_eeprom),
            _ => Err(Error::Unsupported),
        }
    }

    /// Reads a 32-bit value from the EEPROM.
    pub fn eeprom_read_u32(&self, id: NodeId, offset: u32) -> Result<u32> {
        if offset & 0x3 != 0 {
            return Err(Error::InvalidOffset);
        }
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Port6000 | EepromProtocol::BitSerial8111 => {
                // 16-bit-only controllers: two sequential transfers.
                let low = self.eeprom_read_u16(id, offset)?;
                let high = self.eeprom_read_u16(id, offset + 2)?;
                Ok(u32::from(low) | (u32::from(high) << 16))
            }
            EepromProtocol::Ctrl8000 => eep_8000::read_u32(self, id, offset),
            EepromProtocol::None => Err(Error::Unsupported),
        }
    }

    /// Writes a 32-bit value to the EEPROM.
    pub fn eeprom_write_u32(&self, id: NodeId, offset: u32, value: u32) -> Result<()> {
        if offset & 0x3 != 0 {
            return Err(Error::InvalidOffset);
        }
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Port6000 | EepromProtocol::BitSerial8111 => {
                self.eeprom_write_u16(id, offset, value as u16)?;
                self.eeprom_write_u16(id, offset + 2, (value >> 16) as u16)
            }
            EepromProtocol::Ctrl8000 => eep_8000::write_u32(self, id, offset, value),
            EepromProtocol::None => Err(Error::Unsupported),
        }
    }

    /// Reads a 16-bit value from the EEPROM.
    pub fn eeprom_read_u16(&self, id: NodeId, offset: u32) -> Result<u16> {
        if offset & 0x1 != 0 {
            return Err(Error::InvalidOffset);
        }
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Port6000 => eep_6000::read_u16(self, id, offset),
            EepromProtocol::BitSerial8111 => eep_8111::read_u16(self, id, offset),
            EepromProtocol::Ctrl8000 => {
                // 32-bit-only controller: extract the requested half.
                let value = eep_8000::read_u32(self, id, offset & !0x3)?;
                if offset & 0x3 != 0 {
                    Ok((value >> 16) as u16)
                } else {
                    Ok(value as u16)
                }
            }
            EepromProtocol::None => Err(Error::Unsupported),
        }
    }

    /// Writes a 16-bit value to the EEPROM.
    pub fn eeprom_write_u16(&self, id: NodeId, offset: u32, value: u16) -> Result<()> {
        if offset & 0x1 != 0 {
            return Err(Error::InvalidOffset);
        }
        match self.node(id).key.chip.descriptor().eeprom_protocol {
            EepromProtocol::Port6000 => eep_6000::write_u16(self, id, offset, value),
            EepromProtocol::BitSerial8111 => eep_8111::write_u16(self, id, offset, value),
            EepromProtocol::Ctrl8000 => {
                let current = eep_8000::read_u32(self, id, offset & !0x3)?;
                let merged = if offset & 0x3 != 0 {
                    (u32::from(value) << 16) | (current & 0xffff)
                } else {
                    u32::from(value) | (current & 0xffff_0000)
                };
                eep_8000::write_u32(self, id, offset & !0x3, merged)
            }
            EepromProtocol::None => Err(Error::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_6000;
    use crate::fake::fake_8000_eeprom;
    use crate::fake::fake_8111;

    fn only_device(list: &DeviceList) -> NodeId {
        list.find(&KeyMatch::default(), 0).unwrap()
    }

    #[test]
    fn round_trip_per_protocol() {
        for (backend, _state) in [
            fake_8000_eeprom(0x8732, 0xca),
            fake_8111(),
            fake_6000(0x6152),
        ] {
            let list = DeviceList::scan(backend).unwrap();
            let id = only_device(&list);
            for &(offset, value) in
                &[(0x00u32, 0x0123_4567u32), (0x10, 0xffff_ffff), (0x48, 0)]
            {
                list.eeprom_write_u32(id, offset, value).unwrap();
                assert_eq!(list.eeprom_read_u32(id, offset).unwrap(), value);
            }
            // 16-bit halves land where the 32-bit view expects them.
            list.eeprom_write_u16(id, 0x20, 0xbeef).unwrap();
            list.eeprom_write_u16(id, 0x22, 0xdead).unwrap();
            assert_eq!(list.eeprom_read_u32(id, 0x20).unwrap(), 0xdead_beef);
        }
    }

    #[test]
    fn misaligned_offsets_never_touch_hardware() {
        let (backend, state) = fake_8000_eeprom(0x8732, 0xca);
        let list = DeviceList::scan(backend).unwrap();
        let id = only_device(&list);

        let before = state.eeprom_snapshot();
        assert!(matches!(
            list.eeprom_write_u32(id, 0x2, 0x5555_5555),
            Err(Error::InvalidOffset)
        ));
        assert!(matches!(
            list.eeprom_read_u32(id, 0x6),
            Err(Error::InvalidOffset)
        ));
        assert!(matches!(
            list.eeprom_read_u16(id, 0x3),
            Err(Error::InvalidOffset)
        ));
        assert_eq!(state.eeprom_snapshot(), before);
    }

    #[test]
    fn probe_detects_and_restores() {
        let (backend, state) = fake_6000(0x6150);
        let list = DeviceList::scan(backend).unwrap();
        let id = only_device(&list);

        list.eeprom_write_u32(id, 0x50, 0x1234_5678).unwrap();
        assert!(list.eeprom_probe(id).unwrap());
        // Scenario: the scratch offset holds its original value again.
        assert_eq!(list.eeprom_read_u32(id, 0x50).unwrap(), 0x1234_5678);

        // With the EEPROM absent the complement is not retained.
        state.set_eeprom_writable(false);
        assert!(!list.eeprom_probe(id).unwrap());
        assert_eq!(list.eeprom_read_u32(id, 0x50).unwrap(), 0x1234_5678);
    }

    #[test]
    fn present_reports_per_family_status() {
        let (backend, _state) = fake_8000_eeprom(0x8612, 0xba);
        let list = DeviceList::scan(backend).unwrap();
        let id = only_device(&list);
        assert_eq!(list.eeprom_present(id).unwrap(), EepromStatus::Valid);

        let (backend, _state) = fake_6000(0x6150);
        let list = DeviceList::scan(backend).unwrap();
        let id = only_device(&list);
        assert_eq!(list.eeprom_present(id).unwrap(), EepromStatus::Valid);
    }

    #[test]
    fn address_width_dispatch() {
        let (backend, _state) = fake_8000_eeprom(0x8732, 0xca);
        let list = DeviceList::scan(backend).unwrap();
        let id = only_device(&list);
        assert_eq!(list.eeprom_address_width(id).unwrap(), 2);
        assert!(matches!(
            list.eeprom_set_address_width(id, 7),
            Err(Error::InvalidData)
        ));

        let (backend, _state) = fake_6000(0x6150);
        let list = DeviceList::scan(backend).unwrap();
        let id = only_device(&list);
        assert!(matches!(
            list.eeprom_address_width(id),
            Err(Error::Unsupported)
        ));
    }
}
