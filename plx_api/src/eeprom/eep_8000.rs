// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 8000-class EEPROM controller: a command/status register pair behind the
//! chip's memory-mapped register space.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;

use crate::chip::ChipFamily;
use crate::device::ChipMode;
use crate::device::DeviceList;
use crate::device::NodeId;
use crate::CrcStatus;
use crate::EepromStatus;
use crate::Error;
use crate::Result;

/// Controller command opcodes, [15:13] of the control register.
const EE_CMD_WRITE: u32 = 2;
const EE_CMD_READ: u32 = 3;
const EE_CMD_READ_STATUS: u32 = 5;
const EE_CMD_WRITE_ENABLE: u32 = 6;

/// Constant folded into the CRC on each set high bit.
const CRC_XOR_VALUE: u32 = 0xdb71_0641;

/// Budget for one controller-status polling loop.
const POLL_BUDGET: Duration = Duration::from_millis(100);

/// Settle time after unblocking a power-up CRC error.
const CRC_UNBLOCK_DELAY: Duration = Duration::from_millis(50);

/// Absolute offset of the EEPROM control register, or `None` where the
/// controller is unreachable (Mira enhanced-mode USB EP).
fn ctrl_offset(list: &DeviceList, id: NodeId) -> Option<u32> {
    let node = list.node(id);
    if node.key.chip.family == ChipFamily::Mira {
        if node.key.mode == ChipMode::LegacyAdapter {
            return Some(0x1260);
        }
        if node.header_type == 0 {
            return None;
        }
    }
    Some(0x260)
}

pub(super) fn present(list: &DeviceList, id: NodeId) -> Result<EepromStatus> {
    let ctrl = ctrl_offset(list, id).ok_or(Error::Unsupported)?;
    let reg = list.plx_reg_read(id, ctrl, false)?;

    if reg & (1 << 16) == 0 {
        return Ok(EepromStatus::None);
    }
    if reg & (1 << 17) != 0 {
        Ok(EepromStatus::CrcError)
    } else {
        Ok(EepromStatus::Valid)
    }
}

pub(super) fn address_width(list: &DeviceList, id: NodeId) -> Result<u8> {
    let ctrl = ctrl_offset(list, id).ok_or(Error::Unsupported)?;
    let reg = list.plx_reg_read(id, ctrl, false)?;
    Ok(((reg >> 22) & 0x3) as u8)
}

pub(super) fn set_address_width(list: &DeviceList, id: NodeId, width: u8) -> Result<()> {
    let ctrl = ctrl_offset(list, id).ok_or(Error::Unsupported)?;
    let mut reg = list.plx_reg_read(id, ctrl, false)?;

    // Clear the command field so the update does not start a cycle, then
    // request the width override.
    reg &= !(7 << 13);
    reg |= 1 << 21;
    list.plx_reg_write(id, ctrl, reg, false)?;

    let mut reg = list.plx_reg_read(id, ctrl, false)?;
    if reg & (1 << 21) == 0 {
        error!("EEPROM width override not supported by this chip");
        return Err(Error::Unsupported);
    }

    reg &= !(7 << 13);
    reg &= !(3 << 22);
    reg |= u32::from(width & 0x3) << 22;
    list.plx_reg_write(id, ctrl, reg, false)
}

/// Effective byte-address width for command construction. Some chips never
/// report one and are hardwired to 2-byte addressing; a reported width of
/// 0 means undefined and falls back to the per-device default.
fn effective_width(list: &DeviceList, id: NodeId, ctrl_reg: u32) -> u32 {
    let node = list.node(id);
    if node.key.chip.descriptor().eeprom_fixed_width {
        2
    } else {
        match (ctrl_reg >> 22) & 0x3 {
            0 => u32::from(node.default_eeprom_width.load(Ordering::Relaxed)),
            w => w,
        }
    }
}

pub(super) fn read_u32(list: &DeviceList, id: NodeId, offset: u32) -> Result<u32> {
    let ctrl = ctrl_offset(list, id).ok_or(Error::Unsupported)?;
    wait_idle(list, id, ctrl)?;

    let mut reg = list.plx_reg_read(id, ctrl, false)?;
    let width = effective_width(list, id, reg);
    if offset >= 1u32 << (width * 8) {
        error!("offset {:X} exceeds {}-byte addressing", offset, width);
        return Err(Error::InvalidOffset);
    }

    if width == 3 {
        set_upper_address_byte(list, id, ctrl, offset)?;
    }

    // The controller addresses DWORDs, not bytes.
    let index = offset / 4;
    reg &= !(7 << 13);
    reg &= !((1 << 20) | 0x1fff);
    reg |= (index & 0x1fff) | (((index >> 13) & 1) << 20) | (EE_CMD_READ << 13);

    send_command(list, id, ctrl, reg)?;
    list.plx_reg_read(id, ctrl + 0x4, false)
}

pub(super) fn write_u32(list: &DeviceList, id: NodeId, offset: u32, value: u32) -> Result<()> {
    let ctrl = ctrl_offset(list, id).ok_or(Error::Unsupported)?;
    wait_idle(list, id, ctrl)?;

    let mut reg = list.plx_reg_read(id, ctrl, false)?;
    let width = effective_width(list, id, reg);
    if offset >= 1u32 << (width * 8) {
        error!("offset {:X} exceeds {}-byte addressing", offset, width);
        return Err(Error::InvalidOffset);
    }

    if width == 3 {
        set_upper_address_byte(list, id, ctrl, offset)?;
    }

    let index = offset / 4;
    reg &= !(7 << 13);
    reg &= !((1 << 20) | 0x1fff);

    send_command(list, id, ctrl, reg | (EE_CMD_WRITE_ENABLE << 13))?;

    list.plx_reg_write(id, ctrl + 0x4, value, false)?;

    reg |= (index & 0x1fff) | (((index >> 13) & 1) << 20) | (EE_CMD_WRITE << 13);
    send_command(list, id, ctrl, reg)
}

/// Third address byte for 3-byte parts lives in a side register.
fn set_upper_address_byte(list: &DeviceList, id: NodeId, ctrl: u32, offset: u32) -> Result<()> {
    let mut reg = list.plx_reg_read(id, ctrl + 0xc, false)?;
    reg &= !0xff;
    reg |= (offset >> 16) & 0xff;
    list.plx_reg_write(id, ctrl + 0xc, reg, false)
}

/// Waits for the controller to go idle, unblocking a power-up CRC error
/// first if one is latched.
fn wait_idle(list: &DeviceList, id: NodeId, ctrl: u32) -> Result<()> {
    let mut cmd = list.plx_reg_read(id, ctrl, false)?;
    cmd &= !(7 << 13);
    cmd &= !(1 << 24);
    cmd &= !(7 << 28);

    if cmd & (1 << 19) != 0 {
        // A CRC error latched at power-up blocks the controller until it
        // is cleared (write-1) and a dummy read command is issued.
        list.plx_reg_write(id, ctrl, cmd | (EE_CMD_READ << 13), false)?;
        cmd &= !(1 << 19);
        thread::sleep(CRC_UNBLOCK_DELAY);
    }

    let status_cmd = cmd | (EE_CMD_READ_STATUS << 13);
    let deadline = Instant::now() + POLL_BUDGET;
    loop {
        send_command(list, id, ctrl, status_cmd)?;
        let reg = list.plx_reg_read(id, ctrl, false)?;
        // Ready once the read-busy bit and the write-status field clear.
        if reg & (1 << 24) == 0 && reg & (7 << 28) == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
    }
}

/// Issues one controller command and waits for completion.
fn send_command(list: &DeviceList, id: NodeId, ctrl: u32, command: u32) -> Result<()> {
    list.plx_reg_write(id, ctrl, command, false)?;

    // Capella-1 needs ~10us after a command before its EEPROM pins
    // respond; burn it with register reads.
    if list.node(id).key.chip.family == ChipFamily::Capella1 {
        for _ in 0..200 {
            let _ = list.plx_reg_read(id, ctrl, false)?;
        }
    }

    let deadline = Instant::now() + POLL_BUDGET;
    loop {
        let reg = list.plx_reg_read(id, ctrl, false)?;
        if reg & (1 << 18) == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
    }
}

/// EEPROM offset holding the CRC plus the offset calculation starts from.
fn crc_location(list: &DeviceList, id: NodeId) -> Result<(u32, u32)> {
    let node = list.node(id);
    match node.key.chip.family {
        ChipFamily::BridgePcieP2p => {
            // Only 8114 carries a CRC in this family.
            if node.key.chip.chip != 0x8114 {
                return Err(Error::Unsupported);
            }
            if node.key.chip.revision >= 0xba {
                Ok((0x3ec, 0))
            } else {
                Ok((0x378, 0))
            }
        }
        ChipFamily::VegaLite => Ok((0x78f * 4, 0)),
        ChipFamily::Vega => Ok((0xbe4 * 4, 0)),
        ChipFamily::Draco2 | ChipFamily::Capella1 => {
            // The header's byte count locates the CRC behind the
            // register address/data area.
            let header = read_u32(list, id, 0)?;
            if (header >> 16) == 0xffff {
                error!("EEPROM byte count invalid");
                return Err(Error::InvalidData);
            }
            Ok((4 + (header >> 16), 2))
        }
        _ => {
            error!(
                "device {:04X} does not support an EEPROM CRC",
                node.key.chip.chip
            );
            Err(Error::Unsupported)
        }
    }
}

pub(super) fn crc_get(list: &DeviceList, id: NodeId) -> Result<(u32, CrcStatus)> {
    let (crc_offset, _) = crc_location(list, id)?;

    let chip = list.node(id).key.chip.chip;
    let crc = if matches!(chip & 0xff00, 0x8100 | 0x8500) {
        read_u32(list, id, crc_offset)?
    } else {
        // CRC is not DWORD aligned on these parts; assemble it from two
        // 16-bit reads.
        let low = list.eeprom_read_u16(id, crc_offset)?;
        let high = list.eeprom_read_u16(id, crc_offset + 2)?;
        u32::from(low) | (u32::from(high) << 16)
    };

    let ctrl = ctrl_offset(list, id).ok_or(Error::Unsupported)?;
    let reg = list.plx_reg_read(id, ctrl, false)?;
    let status = if (reg >> 16) & 0x3 == 1 {
        CrcStatus::Valid
    } else {
        CrcStatus::Invalid
    };

    debug!("CRC = {:08X} [{:?}] (offset={:X})", crc, status, crc_offset);
    Ok((crc, status))
}

pub(super) fn crc_update(list: &DeviceList, id: NodeId, update_eeprom: bool) -> Result<u32> {
    let (crc_offset, calc_start) = crc_location(list, id)?;

    let mut crc = u32::MAX;
    let mut offset = calc_start;
    while offset < crc_offset {
        let value = if offset & 0x3 != 0 {
            // Data is not DWORD aligned; build the word 16 bits at a
            // time, padding the final partial word with zeroes.
            let low = list.eeprom_read_u16(id, offset)?;
            let high = if offset + 2 < crc_offset {
                list.eeprom_read_u16(id, offset + 2)?
            } else {
                0
            };
            u32::from(low) | (u32::from(high) << 16)
        } else {
            read_u32(list, id, offset)?
        };
        compute_next_crc(&mut crc, value);
        offset += 4;
    }

    debug!("calculated CRC = {:08X} (offset={:X})", crc, crc_offset);

    if update_eeprom {
        if crc_offset & 0x3 != 0 {
            list.eeprom_write_u16(id, crc_offset, crc as u16)?;
            list.eeprom_write_u16(id, crc_offset + 2, (crc >> 16) as u16)?;
        } else {
            write_u32(list, id, crc_offset, crc)?;
        }
    } else {
        debug!("skipping CRC update in EEPROM");
    }

    Ok(crc)
}

/// Folds one 32-bit EEPROM word into the CRC, one bit at a time.
fn compute_next_crc(crc: &mut u32, value: u32) {
    for i in 0..32 {
        let xor = if (*crc ^ (value << i)) & (1 << 31) != 0 {
            CRC_XOR_VALUE
        } else {
            0
        };
        *crc = (*crc << 1) ^ xor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_8000_eeprom;

    #[test]
    fn crc_update_then_get_agree() {
        // Draco-2 locates its CRC from the header byte count.
        let (backend, _state) = fake_8000_eeprom(0x8732, 0xca);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        // Header byte count 0x40 puts the CRC at offset 0x44.
        list.eeprom_write_u32(id, 0, 0x0040_0000).unwrap();
        for i in 0..0x10 {
            list.eeprom_write_u32(id, 4 + i * 4, 0x1111_0000 + i)
                .unwrap();
        }

        let computed = list.eeprom_crc_update(id, true).unwrap();
        let (stored, status) = list.eeprom_crc(id).unwrap();
        assert_eq!(stored, computed);
        assert_eq!(status, CrcStatus::Valid);

        // Recomputing without writes is stable.
        let again = list.eeprom_crc_update(id, false).unwrap();
        assert_eq!(again, computed);
        let (stored_again, _) = list.eeprom_crc(id).unwrap();
        assert_eq!(stored_again, computed);
    }

    #[test]
    fn crc_is_sensitive_to_content() {
        let (backend, _state) = fake_8000_eeprom(0x8732, 0xca);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        list.eeprom_write_u32(id, 0, 0x0040_0000).unwrap();
        let a = list.eeprom_crc_update(id, false).unwrap();
        list.eeprom_write_u32(id, 8, 0xa5a5_a5a5).unwrap();
        let b = list.eeprom_crc_update(id, false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn crc_unsupported_on_crc_less_families() {
        // Deneb has no CRC.
        let (backend, _state) = fake_8000_eeprom(0x8612, 0xba);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        assert!(matches!(list.eeprom_crc(id), Err(Error::Unsupported)));
        assert!(matches!(
            list.eeprom_crc_update(id, false),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn three_byte_parts_set_upper_address_register() {
        let (backend, state) = fake_8000_eeprom(0x8732, 0xca);
        state.set_eeprom_width(3);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        list.eeprom_write_u32(id, 0x2_0000, 0xcafe_f00d).unwrap();
        assert_eq!(list.eeprom_read_u32(id, 0x2_0000).unwrap(), 0xcafe_f00d);
        // Offsets beyond the addressing range are rejected up front.
        assert!(matches!(
            list.eeprom_read_u32(id, 0x100_0000),
            Err(Error::InvalidOffset)
        ));
    }
}
