// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Linux backend over sysfs.
//!
//! Configuration space goes through each device's `config` file;
//! BAR regions are mapped from the `resource%d` files. Reads of `config`
//! through sysfs always reach the hardware, so the uncached read variant
//! simply uses a fresh descriptor.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use log::error;
use log::warn;

use crate::backend::PciBackend;
use crate::backend::PciFunctionInfo;
use crate::backend::RegisterIo;
use crate::pci::ConfigAccess;
use crate::pci::PciAddress;
use crate::pci::PCI_CFG_RD_ERR_VAL;
use crate::Error;
use crate::Result;

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// PCI backend over the host's sysfs tree.
pub struct SysfsBackend {
    root: PathBuf,
}

impl SysfsBackend {
    pub fn new() -> SysfsBackend {
        SysfsBackend {
            root: PathBuf::from(SYSFS_PCI_DEVICES),
        }
    }

    /// Uses an alternate device directory; intended for tests and chroots.
    pub fn with_root<P: AsRef<Path>>(root: P) -> SysfsBackend {
        SysfsBackend {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn device_dir(&self, address: PciAddress) -> PathBuf {
        self.root.join(address.to_string())
    }
}

impl Default for SysfsBackend {
    fn default() -> Self {
        SysfsBackend::new()
    }
}

impl PciBackend for SysfsBackend {
    fn scan(&self) -> Result<Vec<PciFunctionInfo>> {
        let mut functions = Vec::new();
        let entries = std::fs::read_dir(&self.root)?;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let address = match PciAddress::from_str(name) {
                Some(address) => address,
                None => continue,
            };
            match SysfsConfig::open(entry.path().join("config")) {
                Ok(config) => functions.push(PciFunctionInfo {
                    address,
                    config: Arc::new(config),
                }),
                Err(e) => warn!("skipping {}: {}", address, e),
            }
        }
        functions.sort_by_key(|f| f.address);
        Ok(functions)
    }

    fn bar_region(&self, address: PciAddress, bar: usize) -> Option<(u64, u64)> {
        // The `resource` file lists "start end flags" per region.
        let text = std::fs::read_to_string(self.device_dir(address).join("resource")).ok()?;
        let line = text.lines().nth(bar)?;
        let mut fields = line.split_whitespace();
        let start = parse_hex(fields.next()?)?;
        let end = parse_hex(fields.next()?)?;
        if start == 0 || end < start {
            return None;
        }
        Some((start, end - start + 1))
    }

    fn map_bar(&self, address: PciAddress, bar: usize) -> Result<Arc<dyn RegisterIo>> {
        let (_, size) = self
            .bar_region(address, bar)
            .ok_or(Error::InsufficientResources)?;
        let path = self.device_dir(address).join(format!("resource{}", bar));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        // SAFETY: mapping a fresh region of `size` bytes from a file we
        // own; the pointer is only dereferenced through volatile accesses
        // within bounds checked against `size`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            error!("mmap of {} failed", path.display());
            return Err(Error::InsufficientResources);
        }

        Ok(Arc::new(MappedBar {
            ptr: ptr as *mut u8,
            len: size,
        }))
    }
}

fn parse_hex(field: &str) -> Option<u64> {
    u64::from_str_radix(field.trim_start_matches("0x"), 16).ok()
}

/// One function's `config` file.
struct SysfsConfig {
    path: PathBuf,
    file: File,
}

impl SysfsConfig {
    fn open(path: PathBuf) -> std::io::Result<SysfsConfig> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(SysfsConfig { path, file })
    }
}

impl ConfigAccess for SysfsConfig {
    fn read_u32(&self, offset: u32) -> u32 {
        let mut buf = [0u8; 4];
        match self.file.read_exact_at(&mut buf, u64::from(offset & !0x3)) {
            Ok(()) => u32::from_le_bytes(buf),
            Err(_) => PCI_CFG_RD_ERR_VAL,
        }
    }

    fn write_u32(&self, offset: u32, value: u32) {
        if let Err(e) = self
            .file
            .write_all_at(&value.to_le_bytes(), u64::from(offset & !0x3))
        {
            error!("config write to {} failed: {}", self.path.display(), e);
        }
    }

    fn read_u32_uncached(&self, offset: u32) -> u32 {
        // A fresh descriptor guarantees nothing user-side is cached; the
        // kernel issues a real configuration cycle for sysfs reads.
        let mut buf = [0u8; 4];
        let result = File::open(&self.path)
            .and_then(|file| file.read_exact_at(&mut buf, u64::from(offset & !0x3)));
        match result {
            Ok(()) => u32::from_le_bytes(buf),
            Err(_) => PCI_CFG_RD_ERR_VAL,
        }
    }
}

/// A BAR region mapped into the process.
struct MappedBar {
    ptr: *mut u8,
    len: u64,
}

// SAFETY: the mapping stays valid for the struct's lifetime and all
// accesses are volatile and bounds-checked.
unsafe impl Send for MappedBar {}
unsafe impl Sync for MappedBar {}

impl RegisterIo for MappedBar {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_u32(&self, offset: u64) -> u32 {
        if offset + 4 > self.len {
            return PCI_CFG_RD_ERR_VAL;
        }
        // SAFETY: in-bounds MMIO read.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset as usize) as *const u32) }
    }

    fn write_u32(&self, offset: u64, value: u32) {
        if offset + 4 > self.len {
            return;
        }
        // SAFETY: in-bounds MMIO write.
        unsafe { std::ptr::write_volatile(self.ptr.add(offset as usize) as *mut u32, value) }
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        // SAFETY: unmapping the region mapped in `map_bar`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len as libc::size_t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_of_missing_root_fails_cleanly() {
        let backend = SysfsBackend::with_root("/nonexistent/plx-test");
        assert!(backend.scan().is_err());
    }

    #[test]
    fn resource_line_parsing() {
        assert_eq!(parse_hex("0x00000000f0000000"), Some(0xf000_0000));
        assert_eq!(parse_hex("0x0"), Some(0));
        assert_eq!(parse_hex("junk"), None);
    }
}
