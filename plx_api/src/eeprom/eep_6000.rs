// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 6000-series EEPROM port: a single 16-bit command register in
//! configuration space, paced by fixed delays rather than a status bit.

use std::thread;
use std::time::Duration;

use log::error;

use crate::device::DeviceList;
use crate::device::NodeId;
use crate::Error;
use crate::Result;

/// Chip control register; bit 6 exposes the shadow registers on
/// non-transparent parts.
const REG_CHIP_CTRL: u32 = 0xd8;

const READ_DELAY: Duration = Duration::from_micros(50);
const WRITE_DELAY: Duration = Duration::from_micros(100);

/// EEPROM command register offset, which moved between models.
fn ctrl_offset(chip: u16) -> Result<u32> {
    match chip {
        0x6152 | 0x6156 => Ok(0xc8),
        0x6150 | 0x6154 | 0x6254 | 0x6350 | 0x6520 | 0x6540 => Ok(0x54),
        // 6140 has no EEPROM support.
        other => {
            error!("unsupported chip type ({:04X}) for EEPROM access", other);
            Err(Error::Unsupported)
        }
    }
}

/// Non-transparent parts need the shadow-register window enabled around
/// each transaction.
fn needs_shadow_access(chip: u16) -> bool {
    chip == 0x6254 || chip == 0x6540
}

pub(super) fn read_u16(list: &DeviceList, id: NodeId, offset: u32) -> Result<u16> {
    let node = list.node(id);
    let chip = node.key.chip.chip;
    let ctrl = ctrl_offset(chip)?;
    let cfg = node.config();

    let saved = if needs_shadow_access(chip) {
        let reg = cfg.read_u32(REG_CHIP_CTRL);
        cfg.write_u32(REG_CHIP_CTRL, reg | (1 << 6));
        Some(reg)
    } else {
        None
    };

    // The offset field is 8 bits wide.
    let offset = offset & 0xff;
    cfg.write_u32(ctrl, (offset << 8) | (1 << 0));
    thread::sleep(READ_DELAY);
    let value = (cfg.read_u32(ctrl) >> 16) as u16;

    if let Some(reg) = saved {
        cfg.write_u32(REG_CHIP_CTRL, reg);
    }

    Ok(value)
}

pub(super) fn write_u16(list: &DeviceList, id: NodeId, offset: u32, value: u16) -> Result<()> {
    let node = list.node(id);
    let chip = node.key.chip.chip;
    let ctrl = ctrl_offset(chip)?;
    let cfg = node.config();

    let saved = if needs_shadow_access(chip) {
        let reg = cfg.read_u32(REG_CHIP_CTRL);
        cfg.write_u32(REG_CHIP_CTRL, reg | (1 << 6));
        Some(reg)
    } else {
        None
    };

    let offset = offset & 0xff;
    cfg.write_u32(
        ctrl,
        (u32::from(value) << 16) | (offset << 8) | (1 << 1) | (1 << 0),
    );
    thread::sleep(WRITE_DELAY);

    if let Some(reg) = saved {
        cfg.write_u32(REG_CHIP_CTRL, reg);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_6000;

    #[test]
    fn nt_parts_toggle_shadow_window() {
        let (backend, state) = fake_6000(0x6254);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        let node = list.node(id);

        // Seed the chip control register with unrelated bits.
        node.config().write_u32(REG_CHIP_CTRL, 0x0000_0500);

        list.eeprom_write_u16(id, 0x10, 0x4242).unwrap();
        assert_eq!(list.eeprom_read_u16(id, 0x10).unwrap(), 0x4242);

        // The shadow-enable bit is restored after each transaction.
        assert_eq!(node.config().read_u32(REG_CHIP_CTRL), 0x0000_0500);
        assert!(state.shadow_was_toggled());
    }

    #[test]
    fn eeprom_less_model_is_unsupported() {
        let (backend, _state) = fake_6000(0x6140);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        assert!(matches!(
            list.eeprom_read_u16(id, 0),
            Err(Error::Unsupported)
        ));
    }
}
