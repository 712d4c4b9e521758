// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! 8111/8112 EEPROM controller: every address and data byte moves through
//! one control register, with chip-select and strobe bits driven a byte at
//! a time.

use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use log::debug;

use crate::device::DeviceList;
use crate::device::NodeId;
use crate::EepromStatus;
use crate::Error;
use crate::Result;

/// The one control register, reached through the indexed window.
const EE_CTRL: u32 = 0x1004;

/// Serial EEPROM opcodes sent as the first byte of each transaction.
const EE_CMD_WRITE: u8 = 2;
const EE_CMD_READ: u8 = 3;
const EE_CMD_READ_STATUS: u8 = 5;
const EE_CMD_WRITE_ENABLE: u8 = 6;

const EE_BIT_WRITE_START: u32 = 1 << 16;
const EE_BIT_READ_START: u32 = 1 << 17;
const EE_BIT_CHIP_SELECT: u32 = 1 << 18;
const EE_BIT_BUSY: u32 = 1 << 19;

/// Budget for one busy-bit polling loop.
const POLL_BUDGET: Duration = Duration::from_millis(100);

pub(super) fn present(list: &DeviceList, id: NodeId) -> Result<EepromStatus> {
    let reg = list.plx_reg_read(id, EE_CTRL, false)?;
    if reg & (1 << 21) == 0 {
        return Ok(EepromStatus::None);
    }
    // Bit 20 reports a valid signature byte (5Ah).
    if reg & (1 << 20) != 0 {
        Ok(EepromStatus::Valid)
    } else {
        Ok(EepromStatus::InvalidData)
    }
}

pub(super) fn address_width(list: &DeviceList, id: NodeId) -> Result<u8> {
    let reg = list.plx_reg_read(id, EE_CTRL, false)?;
    let width = ((reg >> 22) & 0x3) as u8;
    // A detected width becomes the new per-device default.
    if width != 0 {
        list.node(id)
            .default_eeprom_width
            .store(width, Ordering::Relaxed);
    }
    Ok(width)
}

pub(super) fn set_address_width(list: &DeviceList, id: NodeId, width: u8) -> Result<()> {
    let reg = list.plx_reg_read(id, EE_CTRL, false)?;
    if (reg >> 22) & 0x3 != 0 {
        debug!("EEPROM width already detected by the controller");
        return Err(Error::Unsupported);
    }
    list.node(id)
        .default_eeprom_width
        .store(width, Ordering::Relaxed);
    Ok(())
}

/// Byte-address width used for the address phase; the per-device default
/// covers controllers that report none.
fn effective_width(list: &DeviceList, id: NodeId) -> Result<u32> {
    let reg = list.plx_reg_read(id, EE_CTRL, false)?;
    let width = (reg >> 22) & 0x3;
    if width == 0 {
        Ok(u32::from(
            list.node(id).default_eeprom_width.load(Ordering::Relaxed),
        ))
    } else {
        Ok(width)
    }
}

pub(super) fn read_u16(list: &DeviceList, id: NodeId, offset: u32) -> Result<u16> {
    wait_until_ready(list, id)?;

    data_write(list, id, EE_CMD_READ)?;
    send_address(list, id, offset)?;

    let mut value = 0u16;
    for i in 0..2 {
        let byte = data_read(list, id)?;
        if i == 0 {
            value |= u16::from(byte);
        } else {
            value |= u16::from(byte) << 8;
        }
    }

    // Deassert chip select.
    list.plx_reg_write(id, EE_CTRL, 0, false)?;
    Ok(value)
}

pub(super) fn write_u16(list: &DeviceList, id: NodeId, offset: u32, value: u16) -> Result<()> {
    wait_until_ready(list, id)?;

    data_write(list, id, EE_CMD_WRITE_ENABLE)?;
    list.plx_reg_write(id, EE_CTRL, 0, false)?;

    data_write(list, id, EE_CMD_WRITE)?;
    send_address(list, id, offset)?;

    let mut value = value;
    for _ in 0..2 {
        data_write(list, id, value as u8)?;
        value >>= 8;
    }

    list.plx_reg_write(id, EE_CTRL, 0, false)
}

/// Address phase: one byte per configured address width, high byte first.
fn send_address(list: &DeviceList, id: NodeId, offset: u32) -> Result<()> {
    let width = effective_width(list, id)?;
    if width == 3 {
        // The controller cannot drive a third address byte; send zero.
        data_write(list, id, 0)?;
    }
    if width == 2 || width == 3 {
        data_write(list, id, (offset >> 8) as u8)?;
    }
    data_write(list, id, offset as u8)
}

/// Polls the serial status register until the EEPROM finishes its internal
/// write cycle.
fn wait_until_ready(list: &DeviceList, id: NodeId) -> Result<()> {
    let deadline = Instant::now() + POLL_BUDGET;
    loop {
        data_write(list, id, EE_CMD_READ_STATUS)?;
        let status = data_read(list, id)?;
        list.plx_reg_write(id, EE_CTRL, 0, false)?;
        if status & 1 == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
    }
}

fn wait_idle(list: &DeviceList, id: NodeId) -> Result<()> {
    let deadline = Instant::now() + POLL_BUDGET;
    loop {
        let reg = list.plx_reg_read(id, EE_CTRL, false)?;
        if reg & EE_BIT_BUSY == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
    }
}

/// Clocks one byte out to the EEPROM.
fn data_write(list: &DeviceList, id: NodeId, data: u8) -> Result<()> {
    wait_idle(list, id)?;
    list.plx_reg_write(
        id,
        EE_CTRL,
        EE_BIT_CHIP_SELECT | EE_BIT_WRITE_START | u32::from(data),
        false,
    )?;
    wait_idle(list, id)
}

/// Clocks one byte in from the EEPROM.
fn data_read(list: &DeviceList, id: NodeId) -> Result<u8> {
    wait_idle(list, id)?;
    list.plx_reg_write(id, EE_CTRL, EE_BIT_CHIP_SELECT | EE_BIT_READ_START, false)?;
    wait_idle(list, id)?;
    let reg = list.plx_reg_read(id, EE_CTRL, false)?;
    Ok((reg >> 8) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_8111;

    #[test]
    fn width_falls_back_to_device_default() {
        let (backend, _state) = fake_8111();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        // The fake controller does not auto-detect a width.
        assert_eq!(list.eeprom_address_width(id).unwrap(), 0);
        // An override sticks and subsequent transfers use it.
        list.eeprom_set_address_width(id, 2).unwrap();
        list.eeprom_write_u16(id, 0x40, 0x55aa).unwrap();
        assert_eq!(list.eeprom_read_u16(id, 0x40).unwrap(), 0x55aa);
    }

    #[test]
    fn present_decodes_signature_bits() {
        let (backend, state) = fake_8111();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        assert_eq!(list.eeprom_present(id).unwrap(), EepromStatus::Valid);

        state.set_signature_valid(false);
        assert_eq!(
            list.eeprom_present(id).unwrap(),
            EepromStatus::InvalidData
        );
    }
}
