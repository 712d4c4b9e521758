// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fake PCI backend: an in-memory model of a PLX switch.
//!
//! Stands in for real hardware in unit tests and demos, the way stub PCI
//! devices do elsewhere. The model covers configuration space with
//! capability chains, shared BAR 0 register RAM, the three EEPROM
//! controller generations, the performance-counter FIFO, and the NT
//! virtual/link aliasing of the interrupt-line register.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::backend::PciBackend;
use crate::backend::PciFunctionInfo;
use crate::backend::RegisterIo;
use crate::chip::IdentifyIds;
use crate::pci::ConfigAccess;
use crate::pci::PciAddress;
use crate::Error;
use crate::Result;

const CONFIG_SPACE_SIZE: usize = 4096;

/// One function's configuration space plus builder helpers for laying out
/// capability chains.
pub struct FakeConfig {
    bytes: Arc<Mutex<Vec<u8>>>,
    next_cap: u16,
    prev_cap_hdr: Option<u16>,
    ext_cap_used: bool,
}

impl FakeConfig {
    pub fn new(vendor_id: u16, device_id: u16) -> FakeConfig {
        let mut bytes = vec![0u8; CONFIG_SPACE_SIZE];
        bytes[0..2].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[2..4].copy_from_slice(&device_id.to_le_bytes());
        // Status: capabilities list supported.
        bytes[6] = 0x10;
        FakeConfig {
            bytes: Arc::new(Mutex::new(bytes)),
            next_cap: 0x40,
            prev_cap_hdr: None,
            ext_cap_used: false,
        }
    }

    pub(crate) fn bytes_handle(&self) -> Arc<Mutex<Vec<u8>>> {
        self.bytes.clone()
    }

    fn put_u8(&self, offset: usize, value: u8) {
        self.bytes.lock().unwrap()[offset] = value;
    }

    fn put_u32(&self, offset: usize, value: u32) {
        self.bytes.lock().unwrap()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_revision(&mut self, revision: u8) {
        self.put_u8(0x08, revision);
    }

    /// Sets the 24-bit class code.
    pub fn set_class(&mut self, class_code: u32) {
        let reg = self.read_u32(0x08) & 0xff;
        self.put_u32(0x08, (class_code << 8) | reg);
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        self.put_u8(0x0e, header_type);
    }

    pub fn set_sub_ids(&mut self, sub_vendor_id: u16, sub_device_id: u16) {
        self.put_u32(
            0x2c,
            (u32::from(sub_device_id) << 16) | u32::from(sub_vendor_id),
        );
    }

    pub fn set_secondary_bus(&mut self, bus: u8) {
        self.put_u8(0x19, bus);
    }

    pub fn set_bar(&mut self, index: usize, value: u32) {
        self.put_u32(0x10 + index * 4, value);
    }

    /// Appends a capability to the PCI capability chain and returns its
    /// offset.
    pub fn add_pci_cap(&mut self, id: u8, len: u16) -> u16 {
        let offset = self.next_cap;
        self.next_cap = (offset + len + 3) & !3;

        self.put_u8(offset as usize, id);
        self.put_u8(offset as usize + 1, 0);

        match self.prev_cap_hdr {
            None => self.put_u8(0x34, offset as u8),
            Some(prev) => self.put_u8(prev as usize + 1, offset as u8),
        }
        self.prev_cap_hdr = Some(offset);
        offset
    }

    /// Adds a PCI vendor-specific capability carrying the hard-coded chip
    /// ID. Must be the final capability to be considered valid.
    pub fn add_pci_vsec(&mut self, chip: u16, revision: u8, vsec_id: u8) -> u16 {
        let offset = self.add_pci_cap(0x09, 0x20);
        self.put_u8(offset as usize + 3, vsec_id);
        self.put_u32(
            offset as usize + 0x18,
            (u32::from(chip) << 16) | 0x10b5,
        );
        self.put_u32(offset as usize + 0x1c, u32::from(revision));
        offset
    }

    /// Adds the PCIe vendor-specific extended capability with the
    /// hard-coded chip ID at the extended-capability root.
    pub fn add_ext_vsec(&mut self, chip: u16, revision: u8) -> u16 {
        assert!(!self.ext_cap_used, "extended VSEC already placed");
        self.ext_cap_used = true;
        let offset = 0x100usize;
        // Capability header: ID 000Bh, version 1, no next pointer.
        self.put_u32(offset, 0x000b | (1 << 16));
        // VSEC header: ID 1.
        self.put_u32(offset + 4, 1);
        self.put_u32(offset + 8, (u32::from(chip) << 16) | 0x10b5);
        self.put_u32(offset + 0xc, u32::from(revision));
        offset as u16
    }

    /// Adds a PCIe capability with the given port type/number and link
    /// geometry.
    pub fn add_pcie_cap(&mut self, port_type: u8, port_number: u8, width: u8, speed: u8) -> u16 {
        let offset = self.add_pci_cap(0x10, 0x3c);
        let base = offset as usize;
        // Header: capability version 2, device/port type in [23:20].
        let hdr = self.read_u32(u32::from(offset));
        self.put_u32(base, hdr | (2 << 16) | (u32::from(port_type) << 20));
        // Device capabilities: max payload supported 256.
        self.put_u32(base + 0x04, 0x1);
        // Device control: payload 256, read request 512.
        self.put_u32(base + 0x08, (1 << 5) | (2 << 12));
        // Link capabilities: speed, width, port number.
        self.put_u32(
            base + 0x0c,
            u32::from(speed)
                | (u32::from(width) << 4)
                | (u32::from(port_number) << 24),
        );
        // Link status: negotiated = maximum.
        self.put_u32(
            base + 0x10,
            (u32::from(speed) << 16) | (u32::from(width) << 20),
        );
        offset
    }

    /// The identification inputs a scan would collect for this function.
    pub fn identify_ids(&self) -> IdentifyIds {
        let bytes = self.bytes.lock().unwrap();
        IdentifyIds {
            vendor_id: u16::from_le_bytes([bytes[0], bytes[1]]),
            device_id: u16::from_le_bytes([bytes[2], bytes[3]]),
            sub_vendor_id: u16::from_le_bytes([bytes[0x2c], bytes[0x2d]]),
            sub_device_id: u16::from_le_bytes([bytes[0x2e], bytes[0x2f]]),
            revision: bytes[0x08],
            header_type: bytes[0x0e] & 0x7f,
        }
    }
}

impl ConfigAccess for FakeConfig {
    fn read_u32(&self, offset: u32) -> u32 {
        let offset = offset as usize & !3;
        let bytes = self.bytes.lock().unwrap();
        if offset + 4 > bytes.len() {
            return 0xffff_ffff;
        }
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    fn write_u32(&self, offset: u32, value: u32) {
        let offset = offset as usize & !3;
        let mut bytes = self.bytes.lock().unwrap();
        if offset + 4 <= bytes.len() {
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Backing EEPROM state shared between a controller model and the test.
pub struct FakeEepromState {
    mem: Mutex<Vec<u8>>,
    writable: AtomicBool,
    present: AtomicBool,
    signature_valid: AtomicBool,
    crc_error: AtomicBool,
    /// Reported byte-address width (8000-class controllers).
    width: AtomicU8,
    shadow_toggled: AtomicBool,
}

impl FakeEepromState {
    pub fn new() -> Arc<FakeEepromState> {
        Arc::new(FakeEepromState {
            mem: Mutex::new(vec![0xff; 512]),
            writable: AtomicBool::new(true),
            present: AtomicBool::new(true),
            signature_valid: AtomicBool::new(true),
            crc_error: AtomicBool::new(false),
            width: AtomicU8::new(2),
            shadow_toggled: AtomicBool::new(false),
        })
    }

    pub fn eeprom_snapshot(&self) -> Vec<u8> {
        self.mem.lock().unwrap().clone()
    }

    pub fn set_eeprom_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Relaxed);
    }

    pub fn set_signature_valid(&self, valid: bool) {
        self.signature_valid.store(valid, Ordering::Relaxed);
    }

    pub fn set_eeprom_width(&self, width: u8) {
        self.width.store(width, Ordering::Relaxed);
    }

    pub fn shadow_was_toggled(&self) -> bool {
        self.shadow_toggled.load(Ordering::Relaxed)
    }

    fn read_byte(&self, offset: usize) -> u8 {
        let mem = self.mem.lock().unwrap();
        mem.get(offset).copied().unwrap_or(0xff)
    }

    fn write_byte(&self, offset: usize, value: u8) {
        if !self.writable.load(Ordering::Relaxed) {
            return;
        }
        let mut mem = self.mem.lock().unwrap();
        if offset >= mem.len() {
            mem.resize(offset + 1, 0xff);
        }
        mem[offset] = value;
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.read_byte(offset),
            self.read_byte(offset + 1),
            self.read_byte(offset + 2),
            self.read_byte(offset + 3),
        ])
    }

    fn write_u32(&self, offset: usize, value: u32) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.write_byte(offset + i, *byte);
        }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.read_byte(offset), self.read_byte(offset + 1)])
    }

    fn write_u16(&self, offset: usize, value: u16) {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.write_byte(offset + i, *byte);
        }
    }
}

/// 8000-class EEPROM controller model parked at a control offset in BAR 0.
struct Eep8000Ctrl {
    ctrl: u64,
    state: Arc<FakeEepromState>,
    /// Last written override/width bits ([23:21]).
    shadow: Mutex<u32>,
    data_reg: Mutex<u32>,
    third_byte: Mutex<u32>,
    write_enabled: Mutex<bool>,
}

impl Eep8000Ctrl {
    fn read(&self, offset: u64) -> Option<u32> {
        if offset == self.ctrl {
            let mut reg = *self.shadow.lock().unwrap();
            // Width bits reflect the controller state.
            reg &= !(3 << 22);
            reg |= u32::from(self.state.width.load(Ordering::Relaxed) & 3) << 22;
            if self.state.present.load(Ordering::Relaxed) {
                reg |= 1 << 16;
            }
            if self.state.crc_error.load(Ordering::Relaxed) {
                reg |= (1 << 17) | (1 << 19);
            }
            Some(reg)
        } else if offset == self.ctrl + 4 {
            Some(*self.data_reg.lock().unwrap())
        } else if offset == self.ctrl + 0xc {
            Some(*self.third_byte.lock().unwrap())
        } else {
            None
        }
    }

    fn write(&self, offset: u64, value: u32) -> bool {
        if offset == self.ctrl + 4 {
            *self.data_reg.lock().unwrap() = value;
            return true;
        }
        if offset == self.ctrl + 0xc {
            *self.third_byte.lock().unwrap() = value;
            return true;
        }
        if offset != self.ctrl {
            return false;
        }

        // Writing 1 to bit 19 clears a latched power-up CRC error.
        if value & (1 << 19) != 0 {
            self.state.crc_error.store(false, Ordering::Relaxed);
        }

        // Track the override enable; allow width updates through it.
        let mut shadow = self.shadow.lock().unwrap();
        *shadow = value & (1 << 21);
        if value & (1 << 21) != 0 {
            self.state
                .width
                .store(((value >> 22) & 3) as u8, Ordering::Relaxed);
        }
        drop(shadow);

        let width = self.state.width.load(Ordering::Relaxed);
        let mut address = (u64::from(value & 0x1fff) | (u64::from((value >> 20) & 1) << 13)) * 4;
        if width == 3 {
            address |= u64::from(*self.third_byte.lock().unwrap() & 0xff) << 16;
        }

        match (value >> 13) & 7 {
            // Read: latch the addressed DWORD into the data register.
            3 => {
                *self.data_reg.lock().unwrap() = self.state.read_u32(address as usize);
            }
            // Write: commit the data register when write-enabled.
            2 => {
                let mut enabled = self.write_enabled.lock().unwrap();
                if *enabled {
                    let data = *self.data_reg.lock().unwrap();
                    self.state.write_u32(address as usize, data);
                    *enabled = false;
                }
            }
            6 => *self.write_enabled.lock().unwrap() = true,
            _ => {}
        }
        true
    }
}

/// Performance-counter capture RAM with a FIFO read pointer.
struct PerfRam {
    ram_ctrl: u64,
    fifo: u64,
    data: Mutex<Vec<u32>>,
    pointer: Mutex<usize>,
}

impl PerfRam {
    fn read(&self, offset: u64) -> Option<u32> {
        if offset != self.fifo {
            return None;
        }
        let data = self.data.lock().unwrap();
        let mut pointer = self.pointer.lock().unwrap();
        let value = data.get(*pointer).copied().unwrap_or(0);
        *pointer += 1;
        Some(value)
    }

    fn write(&self, offset: u64, value: u32) -> bool {
        if offset != self.ram_ctrl {
            return false;
        }
        if value & (1 << 2) != 0 {
            *self.pointer.lock().unwrap() = 0;
        }
        true
    }
}

/// Shared BAR 0 register RAM, with optional controller models layered in.
pub struct FakeBarRam {
    size: u64,
    cells: Mutex<HashMap<u64, u32>>,
    eeprom: Mutex<Option<Eep8000Ctrl>>,
    perf: Mutex<Option<PerfRam>>,
    /// BAR offsets aliased onto another function's interrupt-line
    /// register (NT window behavior).
    aliases: Mutex<Vec<(u64, Arc<Mutex<Vec<u8>>>)>>,
}

impl FakeBarRam {
    pub fn new(size: u64) -> Arc<FakeBarRam> {
        Arc::new(FakeBarRam {
            size,
            cells: Mutex::new(HashMap::new()),
            eeprom: Mutex::new(None),
            perf: Mutex::new(None),
            aliases: Mutex::new(Vec::new()),
        })
    }

    /// Reads a plain cell without going through any controller model.
    pub fn peek(&self, offset: u64) -> u32 {
        self.cells.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn poke(&self, offset: u64, value: u32) {
        self.cells.lock().unwrap().insert(offset, value);
    }

    pub fn install_eeprom_8000(&self, ctrl: u64, state: Arc<FakeEepromState>) {
        *self.eeprom.lock().unwrap() = Some(Eep8000Ctrl {
            ctrl,
            state,
            shadow: Mutex::new(0),
            data_reg: Mutex::new(0),
            third_byte: Mutex::new(0),
            write_enabled: Mutex::new(false),
        });
    }

    pub fn install_perf(&self, ram_ctrl: u64, fifo: u64, data: Vec<u32>) {
        *self.perf.lock().unwrap() = Some(PerfRam {
            ram_ctrl,
            fifo,
            data: Mutex::new(data),
            pointer: Mutex::new(0),
        });
    }

    pub fn set_perf_data(&self, data: Vec<u32>) {
        if let Some(perf) = &*self.perf.lock().unwrap() {
            *perf.data.lock().unwrap() = data;
        }
    }

    /// Aliases `offset` onto `target`'s interrupt-line config register.
    pub(crate) fn add_interrupt_line_alias(&self, offset: u64, target: Arc<Mutex<Vec<u8>>>) {
        self.aliases.lock().unwrap().push((offset, target));
    }
}

impl RegisterIo for FakeBarRam {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_u32(&self, offset: u64) -> u32 {
        if let Some(eeprom) = &*self.eeprom.lock().unwrap() {
            if let Some(value) = eeprom.read(offset) {
                return value;
            }
        }
        if let Some(perf) = &*self.perf.lock().unwrap() {
            if let Some(value) = perf.read(offset) {
                return value;
            }
        }
        for (alias, target) in self.aliases.lock().unwrap().iter() {
            if *alias == offset {
                let bytes = target.lock().unwrap();
                return u32::from_le_bytes([bytes[0x3c], bytes[0x3d], bytes[0x3e], bytes[0x3f]]);
            }
        }
        self.peek(offset)
    }

    fn write_u32(&self, offset: u64, value: u32) {
        if let Some(eeprom) = &*self.eeprom.lock().unwrap() {
            if eeprom.write(offset, value) {
                return;
            }
        }
        if let Some(perf) = &*self.perf.lock().unwrap() {
            if perf.write(offset, value) {
                return;
            }
        }
        for (alias, target) in self.aliases.lock().unwrap().iter() {
            if *alias == offset {
                let mut bytes = target.lock().unwrap();
                bytes[0x3c..0x40].copy_from_slice(&value.to_le_bytes());
                return;
            }
        }
        self.poke(offset, value);
    }
}

/// 8111 bit-serial EEPROM engine behind the indexed window.
struct Engine8111 {
    bytes_in: Vec<u8>,
    reads_done: usize,
    out_byte: u8,
    write_enabled: bool,
}

/// Per-function state of the 8111 indexed register window.
struct WindowState {
    regs: Mutex<[u32; 0x68 / 4]>,
    index: Mutex<u32>,
    engine: Mutex<Engine8111>,
    eeprom: Arc<FakeEepromState>,
}

impl WindowState {
    /// Dword index of the EEPROM control register (1004h) in the window.
    const EE_CTRL_SLOT: u32 = 1;

    fn window_read(&self, slot: u32) -> u32 {
        if slot == Self::EE_CTRL_SLOT {
            let engine = self.engine.lock().unwrap();
            let mut reg = u32::from(engine.out_byte) << 8;
            if self.eeprom.present.load(Ordering::Relaxed) {
                reg |= 1 << 21;
            }
            if self.eeprom.signature_valid.load(Ordering::Relaxed) {
                reg |= 1 << 20;
            }
            return reg;
        }
        self.regs
            .lock()
            .unwrap()
            .get(slot as usize)
            .copied()
            .unwrap_or(0)
    }

    fn window_write(&self, slot: u32, value: u32) {
        if slot == Self::EE_CTRL_SLOT {
            self.engine_write(value);
            return;
        }
        if let Some(reg) = self.regs.lock().unwrap().get_mut(slot as usize) {
            *reg = value;
        }
    }

    fn engine_write(&self, value: u32) {
        let mut engine = self.engine.lock().unwrap();

        if value & (1 << 18) == 0 {
            // Chip select deasserted: commit the collected transaction.
            let bytes = std::mem::take(&mut engine.bytes_in);
            engine.reads_done = 0;
            match bytes.first() {
                Some(6) => engine.write_enabled = true,
                Some(2) => {
                    if bytes.len() >= 3 && engine.write_enabled {
                        let address =
                            (usize::from(bytes[1]) << 8) | usize::from(bytes[2]);
                        for (i, data) in bytes[3..].iter().enumerate() {
                            self.eeprom.write_byte(address + i, *data);
                        }
                    }
                    engine.write_enabled = false;
                }
                _ => {}
            }
            return;
        }

        if value & (1 << 16) != 0 {
            engine.bytes_in.push(value as u8);
        } else if value & (1 << 17) != 0 {
            let out = match engine.bytes_in.first().copied() {
                // Read command: address phase is two bytes, big endian.
                Some(3) if engine.bytes_in.len() >= 3 => {
                    let address = (usize::from(engine.bytes_in[1]) << 8)
                        | usize::from(engine.bytes_in[2]);
                    let byte = self.eeprom.read_byte(address + engine.reads_done);
                    engine.reads_done += 1;
                    byte
                }
                // Status: never busy.
                Some(5) => 0,
                _ => 0,
            };
            engine.out_byte = out;
        }
    }
}

/// 6000-series EEPROM command port model (a config-space register).
struct Eep6000State {
    ctrl: u32,
    last_cmd: Mutex<u32>,
    eeprom: Arc<FakeEepromState>,
}

/// One fake function: config space plus any controller models.
pub struct FakeFunction {
    address: PciAddress,
    cfg: FakeConfig,
    bar0: Option<Arc<FakeBarRam>>,
    window: Option<WindowState>,
    eeprom_6000: Option<Eep6000State>,
}

impl ConfigAccess for FakeFunction {
    fn read_u32(&self, offset: u32) -> u32 {
        if let Some(window) = &self.window {
            if offset == 0x84 {
                return *window.index.lock().unwrap();
            }
            if offset == 0x88 {
                let index = *window.index.lock().unwrap();
                return window.window_read(index / 4);
            }
        }
        if let Some(eeprom) = &self.eeprom_6000 {
            if offset == eeprom.ctrl {
                let cmd = *eeprom.last_cmd.lock().unwrap();
                let word = eeprom.eeprom.read_u16(((cmd >> 8) & 0xff) as usize);
                return (u32::from(word) << 16) | (cmd & 0xffff);
            }
        }
        self.cfg.read_u32(offset)
    }

    fn write_u32(&self, offset: u32, value: u32) {
        if let Some(window) = &self.window {
            if offset == 0x84 {
                *window.index.lock().unwrap() = value;
                return;
            }
            if offset == 0x88 {
                let index = *window.index.lock().unwrap();
                window.window_write(index / 4, value);
                return;
            }
        }
        if let Some(eeprom) = &self.eeprom_6000 {
            if offset == eeprom.ctrl {
                *eeprom.last_cmd.lock().unwrap() = value;
                if value & 1 != 0 {
                    // Record whether the shadow window was open.
                    if self.cfg.read_u32(0xd8) & (1 << 6) != 0 {
                        eeprom.eeprom.shadow_toggled.store(true, Ordering::Relaxed);
                    }
                    if value & (1 << 1) != 0 {
                        eeprom
                            .eeprom
                            .write_u16(((value >> 8) & 0xff) as usize, (value >> 16) as u16);
                    }
                }
                return;
            }
        }
        self.cfg.write_u32(offset, value);
    }
}

/// In-memory PCI backend.
#[derive(Default)]
pub struct FakeBackend {
    functions: Mutex<Vec<Arc<FakeFunction>>>,
}

impl FakeBackend {
    pub fn new() -> FakeBackend {
        FakeBackend::default()
    }

    /// Adds a plain function, optionally with BAR 0 backed by `bar0`.
    pub fn add_function(
        &self,
        address: PciAddress,
        cfg: FakeConfig,
        bar0: Option<Arc<FakeBarRam>>,
    ) -> Arc<FakeFunction> {
        self.add_function_inner(address, cfg, bar0, None, None)
    }

    fn add_function_inner(
        &self,
        address: PciAddress,
        cfg: FakeConfig,
        bar0: Option<Arc<FakeBarRam>>,
        window: Option<WindowState>,
        eeprom_6000: Option<Eep6000State>,
    ) -> Arc<FakeFunction> {
        let function = Arc::new(FakeFunction {
            address,
            cfg,
            bar0,
            window,
            eeprom_6000,
        });
        self.functions.lock().unwrap().push(function.clone());
        function
    }

    fn function_at(&self, address: PciAddress) -> Option<Arc<FakeFunction>> {
        self.functions
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.address == address)
            .cloned()
    }
}

impl PciBackend for FakeBackend {
    fn scan(&self) -> Result<Vec<PciFunctionInfo>> {
        let functions = self.functions.lock().unwrap();
        Ok(functions
            .iter()
            .map(|f| PciFunctionInfo {
                address: f.address,
                config: f.clone() as Arc<dyn ConfigAccess>,
            })
            .collect())
    }

    fn bar_region(&self, address: PciAddress, bar: usize) -> Option<(u64, u64)> {
        let function = self.function_at(address)?;
        if bar != 0 {
            return None;
        }
        let ram = function.bar0.as_ref()?;
        let physical = u64::from(function.cfg.read_u32(0x10) & !0xf);
        Some((physical, ram.len()))
    }

    fn map_bar(&self, address: PciAddress, bar: usize) -> Result<Arc<dyn RegisterIo>> {
        let function = self
            .function_at(address)
            .ok_or(Error::InvalidObject)?;
        if bar != 0 {
            return Err(Error::InsufficientResources);
        }
        match &function.bar0 {
            Some(ram) => Ok(ram.clone() as Arc<dyn RegisterIo>),
            None => Err(Error::InsufficientResources),
        }
    }
}

fn addr(bus: u8, dev: u8, func: u8) -> PciAddress {
    PciAddress {
        domain: 0,
        bus,
        dev,
        func,
    }
}

/// A small Deneb switch: upstream port with BAR 0, a downstream port
/// without one, and an endpoint behind the downstream port.
pub fn fake_switch() -> (Arc<FakeBackend>, Arc<FakeBarRam>) {
    let backend = Arc::new(FakeBackend::new());
    let ram = FakeBarRam::new(0x40000);

    let mut up = FakeConfig::new(0x10b5, 0x8612);
    up.set_revision(0xba);
    up.set_header_type(1);
    up.set_class(0x060400);
    up.set_secondary_bus(1);
    up.set_bar(0, 0xf000_0000);
    up.add_pcie_cap(5, 0, 4, 2);
    up.add_pci_vsec(0x8612, 0xba, 1);
    backend.add_function(addr(0, 0, 0), up, Some(ram.clone()));

    let mut ds = FakeConfig::new(0x10b5, 0x8612);
    ds.set_revision(0xba);
    ds.set_header_type(1);
    ds.set_class(0x060400);
    ds.set_secondary_bus(2);
    ds.add_pcie_cap(6, 2, 4, 2);
    ds.add_pci_vsec(0x8612, 0xba, 1);
    backend.add_function(addr(1, 2, 0), ds, None);

    let mut ep = FakeConfig::new(0x10b5, 0x8612);
    ep.set_revision(0xba);
    ep.set_header_type(0);
    ep.set_class(0x040000);
    ep.add_pcie_cap(0, 8, 1, 1);
    ep.add_pci_vsec(0x8612, 0xba, 1);
    backend.add_function(addr(2, 0, 0), ep, None);

    (backend, ram)
}

/// A lone 8111 bridge with the bit-serial EEPROM engine.
pub fn fake_8111() -> (Arc<FakeBackend>, Arc<FakeEepromState>) {
    let backend = Arc::new(FakeBackend::new());
    let state = FakeEepromState::new();

    let mut cfg = FakeConfig::new(0x10b5, 0x8111);
    cfg.set_revision(0x21);
    cfg.set_header_type(1);
    cfg.set_class(0x060400);

    let window = WindowState {
        regs: Mutex::new([0; 0x68 / 4]),
        index: Mutex::new(0),
        engine: Mutex::new(Engine8111 {
            bytes_in: Vec::new(),
            reads_done: 0,
            out_byte: 0,
            write_enabled: false,
        }),
        eeprom: state.clone(),
    };
    backend.add_function_inner(addr(0, 0, 0), cfg, None, Some(window), None);

    (backend, state)
}

/// A lone 6000-series bridge with the 16-bit EEPROM command port.
pub fn fake_6000(chip: u16) -> (Arc<FakeBackend>, Arc<FakeEepromState>) {
    let backend = Arc::new(FakeBackend::new());
    let state = FakeEepromState::new();

    let mut cfg = FakeConfig::new(0x10b5, chip);
    cfg.set_revision(0x04);
    cfg.set_header_type(1);
    cfg.set_class(0x060400);
    cfg.add_pci_vsec(chip, 0xbb, 1);

    let ctrl = match chip {
        0x6152 | 0x6156 => 0xc8,
        _ => 0x54,
    };
    let eeprom_6000 = Eep6000State {
        ctrl,
        last_cmd: Mutex::new(0),
        eeprom: state.clone(),
    };
    backend.add_function_inner(addr(0, 0, 0), cfg, None, None, Some(eeprom_6000));

    (backend, state)
}

/// A lone 8000-class port with the command/status EEPROM controller.
pub fn fake_8000_eeprom(chip: u16, revision: u8) -> (Arc<FakeBackend>, Arc<FakeEepromState>) {
    let backend = Arc::new(FakeBackend::new());
    let state = FakeEepromState::new();
    let ram = FakeBarRam::new(0x40000);
    ram.install_eeprom_8000(0x260, state.clone());

    let mut cfg = FakeConfig::new(0x10b5, chip);
    cfg.set_revision(revision);
    cfg.set_header_type(1);
    cfg.set_class(0x060400);
    cfg.set_bar(0, 0xf010_0000);
    cfg.add_pcie_cap(5, 0, 8, 3);
    cfg.add_pci_vsec(chip, revision, 1);
    backend.add_function(addr(0, 0, 0), cfg, Some(ram));

    (backend, state)
}

/// A lone port with perf-counter capture RAM behind BAR 0.
pub fn fake_perf(chip: u16, revision: u8, data: Vec<u32>) -> (Arc<FakeBackend>, Arc<FakeBarRam>) {
    let backend = Arc::new(FakeBackend::new());
    let ram = FakeBarRam::new(0x40000);

    // RAM control/FIFO offsets moved between generations.
    let (ram_ctrl, fifo) = match chip & 0xff00 {
        0x8700 => (0x3f0, 0x3e4),
        _ => (0x618, 0x628),
    };
    ram.install_perf(ram_ctrl, fifo, data);

    let mut cfg = FakeConfig::new(0x10b5, chip);
    cfg.set_revision(revision);
    cfg.set_header_type(1);
    cfg.set_class(0x060400);
    cfg.set_bar(0, 0xf020_0000);
    cfg.add_pcie_cap(5, 0, 8, 3);
    cfg.add_pci_vsec(chip, revision, 1);
    backend.add_function(addr(0, 0, 0), cfg, Some(ram.clone()));

    (backend, ram)
}

/// A management port of a multi-host capable switch with two enabled
/// virtual switches: VS0 (upstream 0, downstream {1,2,3}) and VS2
/// (upstream 10, downstream {8,9}).
pub fn fake_multi_host() -> (Arc<FakeBackend>, Arc<FakeBarRam>) {
    let backend = Arc::new(FakeBackend::new());
    let ram = FakeBarRam::new(0x40000);

    // Management port config: active port 0, enabled.
    ram.poke(0x354, 1 << 5);
    ram.poke(0x358, 0b101);
    ram.poke(0x360, 0);
    ram.poke(0x368, 10);
    ram.poke(0x380, 0b1111);
    ram.poke(0x388, 0x300);

    let mut cfg = FakeConfig::new(0x10b5, 0x8732);
    cfg.set_revision(0xab);
    cfg.set_header_type(1);
    cfg.set_class(0x060400);
    cfg.set_bar(0, 0xf030_0000);
    cfg.add_pcie_cap(5, 0, 16, 3);
    cfg.add_pci_vsec(0x8732, 0xab, 1);
    backend.add_function(addr(0, 0, 0), cfg, Some(ram.clone()));

    (backend, ram)
}

/// An NT endpoint of a Draco-1 switch. With `link_side` the BAR window
/// aliases a different function's config space, so the probe write is not
/// visible through this device's own configuration registers.
pub fn fake_nt_draco(link_side: bool) -> (Arc<FakeBackend>, Arc<FakeBarRam>) {
    let backend = Arc::new(FakeBackend::new());
    let ram = FakeBarRam::new(0x40000);

    let mut nt = FakeConfig::new(0x10b5, 0x8748);
    nt.set_revision(0xaa);
    nt.set_header_type(0);
    nt.set_class(0x068000);
    nt.set_bar(0, 0xf040_0000);
    nt.add_pcie_cap(0, 1, 8, 3);
    nt.add_pci_vsec(0x8748, 0xaa, 1);

    if link_side {
        // The virtual side's registers live behind the same window.
        let other = FakeConfig::new(0x10b5, 0x87b0);
        ram.add_interrupt_line_alias(0x3e000 + 0x3c, other.bytes_handle());
    } else {
        ram.add_interrupt_line_alias(0x3e000 + 0x3c, nt.bytes_handle());
    }

    backend.add_function(addr(0, 0, 0), nt, Some(ram.clone()));
    (backend, ram)
}
