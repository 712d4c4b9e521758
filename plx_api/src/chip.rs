// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Chip identity resolution.
//!
//! Given a function's PCI IDs and live configuration-space probes, resolve
//! which PLX chip model it is, the silicon revision, and the chip family.
//! Family membership is resolved exactly once here; everything else in the
//! crate consumes the result through [`FamilyDescriptor`] instead of
//! re-deriving it from raw ID ranges.

use std::fmt;
use std::fmt::Display;

use log::error;
use serde::Deserialize;
use serde::Serialize;

use crate::pci::find_capability;
use crate::pci::ConfigAccess;
use crate::pci::INTEL_VENDOR_ID;
use crate::pci::LSI_VENDOR_ID;
use crate::pci::PCIE_CAP_ID_VENDOR_SPECIFIC;
use crate::pci::PCIE_EXT_CAP_BASE;
use crate::pci::PCI_CAP_ID_VENDOR_SPECIFIC;
use crate::pci::PCI_CAP_ID_VPD;
use crate::pci::PLX_VENDOR_ID;
use crate::Error;
use crate::Result;

/// Models whose hard-coded revision register is not updated by hardware;
/// for these the PCI config-space revision is authoritative.
const STALE_HARDCODED_REVISION: [u16; 6] = [0x8612, 0x8616, 0x8624, 0x8632, 0x8647, 0x8648];

/// Chip ID offset within a PCI vendor-specific capability.
const PCI_VSEC_CHIP_ID_OFFSET: u32 = 0x18;
/// Chip ID offset within a PCIe vendor-specific extended capability.
const PCIE_VSEC_CHIP_ID_OFFSET: u32 = 0x8;

/// PLX chip families. One tag per register-layout generation.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum ChipFamily {
    #[default]
    None,
    Unknown,
    /// 9000-series PCI-to-local-bus bridges.
    BridgeP2L,
    /// 6000-series PCI-to-PCI bridges.
    BridgePciP2p,
    /// 8111/8112/8114 PCIe-to-PCI bridges.
    BridgePcieP2p,
    Altair,
    AltairXl,
    Vega,
    VegaLite,
    Deneb,
    Sirius,
    Cygnus,
    Mira,
    Scout,
    Draco1,
    Draco2,
    Capella1,
    Capella2,
    Atlas,
}

impl Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ChipFamily::None => "-",
            ChipFamily::Unknown => "Unknown",
            ChipFamily::BridgeP2L => "Bridge(P2L)",
            ChipFamily::BridgePciP2p => "Bridge(PCI P2P)",
            ChipFamily::BridgePcieP2p => "Bridge(PCIe P2P)",
            ChipFamily::Altair => "Altair",
            ChipFamily::AltairXl => "Altair-XL",
            ChipFamily::Vega => "Vega",
            ChipFamily::VegaLite => "Vega-Lite",
            ChipFamily::Deneb => "Deneb",
            ChipFamily::Sirius => "Sirius",
            ChipFamily::Cygnus => "Cygnus",
            ChipFamily::Mira => "Mira",
            ChipFamily::Scout => "Scout",
            ChipFamily::Draco1 => "Draco-1",
            ChipFamily::Draco2 => "Draco-2",
            ChipFamily::Capella1 => "Capella-1",
            ChipFamily::Capella2 => "Capella-2",
            ChipFamily::Atlas => "Atlas",
        };
        write!(f, "{}", name)
    }
}

/// Register access protocol of a chip class.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegProtocol {
    /// No PLX-specific register access.
    None,
    /// Index/data window in configuration space (8111/8112).
    IndexedWindow,
    /// Registers behind the memory-mapped BAR 0 (8114 and 8000-class).
    MemoryMapped,
}

/// EEPROM controller protocol of a chip class.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EepromProtocol {
    None,
    /// 16-bit-only port in configuration space (6000 series).
    Port6000,
    /// Bit-serial controller behind the indexed window (8111/8112).
    BitSerial8111,
    /// Command/status controller at a family-specific offset (8000-class).
    Ctrl8000,
}

/// Per-family constants bundled at identity-resolution time so no other
/// module re-derives family membership from raw ID ranges.
#[derive(Copy, Clone, Debug)]
pub struct FamilyDescriptor {
    pub reg_protocol: RegProtocol,
    pub eeprom_protocol: EepromProtocol,
    /// Extra base added to port-adjusted register offsets; nonzero only for
    /// chips whose per-port registers start high inside BAR 0.
    pub port_reg_extra_base: u32,
    /// EEPROM byte-address width is hardwired rather than reported.
    pub eeprom_fixed_width: bool,
    pub supports_multi_host: bool,
}

/// Resolved chip identity.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChipIdentity {
    pub chip: u16,
    pub revision: u8,
    pub family: ChipFamily,
}

impl ChipIdentity {
    pub fn descriptor(&self) -> FamilyDescriptor {
        let reg_protocol = match generalize_for_dispatch(self.chip) {
            0x8111 | 0x8112 => RegProtocol::IndexedWindow,
            0x8114 | 0x8000 => RegProtocol::MemoryMapped,
            _ => RegProtocol::None,
        };
        let eeprom_protocol = match generalize_for_dispatch(self.chip) {
            0x6150 | 0x6152 | 0x6154 | 0x6156 | 0x6254 | 0x6350 | 0x6520 | 0x6540 => {
                EepromProtocol::Port6000
            }
            0x8111 | 0x8112 => EepromProtocol::BitSerial8111,
            0x8114 | 0x8000 => EepromProtocol::Ctrl8000,
            _ => EepromProtocol::None,
        };
        FamilyDescriptor {
            reg_protocol,
            eeprom_protocol,
            port_reg_extra_base: if self.family == ChipFamily::Atlas {
                0x80_0000
            } else {
                0
            },
            eeprom_fixed_width: self.chip == 0x8114
                || matches!(self.family, ChipFamily::Vega | ChipFamily::VegaLite),
            supports_multi_host: matches!(
                self.family,
                ChipFamily::Cygnus | ChipFamily::Draco1 | ChipFamily::Draco2 | ChipFamily::Capella1
            ),
        }
    }
}

/// Inputs to [`identify`] that come from the enumeration scan rather than
/// from live register probes.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentifyIds {
    pub vendor_id: u16,
    pub device_id: u16,
    pub sub_vendor_id: u16,
    pub sub_device_id: u16,
    pub revision: u8,
    pub header_type: u8,
}

/// Groups register/EEPROM-dispatch classes: every memory-mapped 8000-series
/// derivative collapses to 0x8000.
pub(crate) fn generalize_for_dispatch(chip: u16) -> u16 {
    match chip & 0xff00 {
        0x2300 | 0x3300 | 0x8500 | 0x8600 | 0x8700 | 0x9700 | 0xc000 => 0x8000,
        _ => chip,
    }
}

/// Resolves chip model, revision, and family for one function.
///
/// Never fails: non-PLX hardware resolves to model 0 / family `None`, and a
/// model with no family mapping resolves to `Unknown`.
pub fn identify(cfg: &dyn ConfigAccess, ids: &IdentifyIds) -> ChipIdentity {
    if let Some((chip, revision)) = find_hardcoded_id(cfg, ids) {
        let family = family_of(chip, ids.device_id, revision);
        return ChipIdentity {
            chip,
            revision,
            family,
        };
    }

    let chip = fallback_table_lookup(cfg, ids);
    let revision = detect_revision(chip, ids.revision);
    let family = family_of(chip, ids.device_id, revision);
    ChipIdentity {
        chip,
        revision,
        family,
    }
}

/// Searches PCI then PCIe vendor-specific capabilities for the hard-coded
/// chip ID structure. Returns `(chip, revision)` when present.
fn find_hardcoded_id(cfg: &dyn ConfigAccess, ids: &IdentifyIds) -> Option<(u16, u8)> {
    for pcie_pass in [false, true] {
        if pcie_pass {
            // Some Intel devices carry a coincidentally matching VSEC.
            if ids.vendor_id == INTEL_VENDOR_ID {
                continue;
            }
            // Chipsets that alias the extended config region report the
            // device's own Dev/Ven ID at 100h; that is not a capability.
            let root = cfg.read_u32(u32::from(PCIE_EXT_CAP_BASE));
            if root == (u32::from(ids.device_id) << 16) | u32::from(ids.vendor_id) {
                continue;
            }
        }

        let (cap_id, id_offset) = if pcie_pass {
            (PCIE_CAP_ID_VENDOR_SPECIFIC, PCIE_VSEC_CHIP_ID_OFFSET)
        } else {
            (PCI_CAP_ID_VENDOR_SPECIFIC, PCI_VSEC_CHIP_ID_OFFSET)
        };

        let mut instance = 0u8;
        loop {
            let offset = find_capability(cfg, cap_id, pcie_pass, instance);
            if offset == 0 || instance == u8::MAX {
                break;
            }
            instance += 1;

            // Check the VSEC-specific ID before trusting its contents.
            if pcie_pass {
                // 4h[15:0] holds the VSEC ID per PCIe; valid ID is 1.
                let vsec_id = cfg.read_u32(u32::from(offset) + 4) as u16;
                if vsec_id != 1 {
                    continue;
                }
            } else {
                // 0h[31:24] is reused for the VSEC ID since the PCI spec
                // leaves it undefined; valid IDs are 0 or 1 and the VSEC
                // must be the final capability.
                let header = cfg.read_u32(u32::from(offset));
                let vsec_id = (header >> 24) as u8;
                if (vsec_id != 0 && vsec_id != 1) || ((header >> 8) as u8) != 0 {
                    continue;
                }
            }

            let reg = cfg.read_u32(u32::from(offset) + id_offset);
            let vendor = (reg & 0xffff) as u16;
            if vendor != PLX_VENDOR_ID && vendor != LSI_VENDOR_ID {
                continue;
            }

            let mut chip = (reg >> 16) as u16;
            let mut revision = ids.revision;

            if !STALE_HARDCODED_REVISION.contains(&chip) {
                revision = cfg.read_u32(u32::from(offset) + id_offset + 4) as u8;
            }

            // MPT endpoints report a placeholder model; recover the real
            // one from whichever ID falls in the C0xx range.
            if chip == 0x00b2 {
                if (ids.device_id & 0xff00) == 0xc000 {
                    chip = ids.device_id;
                } else if (ids.sub_device_id & 0xff00) == 0xc000 {
                    chip = ids.sub_device_id;
                } else {
                    chip = 0xc012;
                }
            }

            if (chip & 0xff00) == 0xc000 && revision == 0xaa {
                revision = 0xa0;
            }

            return Some((chip, revision));
        }
    }

    None
}

/// Device/Vendor ID table lookup for chips without a hard-coded ID.
fn fallback_table_lookup(cfg: &dyn ConfigAccess, ids: &IdentifyIds) -> u16 {
    let mut device_id = ids.device_id;

    // Group the 8000-series derivatives, minus the 8311 RDK board.
    if ids.vendor_id == PLX_VENDOR_ID || ids.vendor_id == LSI_VENDOR_ID {
        match device_id & 0xff00 {
            0x2300 | 0x3300 | 0x8500 | 0x8600 | 0x8700 | 0x9700 | 0xc000 | 0x8100 => {
                if device_id != 0x86e1 {
                    device_id = 0x8000;
                }
            }
            _ => {}
        }
    }

    match (u32::from(device_id) << 16) | u32::from(ids.vendor_id) {
        0x8000_10b5 | 0x8000_1000 => {
            // DMA & NT-Virtual functions with a placeholder ID carry the
            // real model in the subsystem ID.
            if ids.device_id == 0x87b0 || ids.device_id == 0x87d0 {
                ids.sub_device_id
            } else {
                ids.device_id
            }
        }

        // Base-mode MPT without a PCIe VSEC yet.
        0x00b2_1000 => {
            if ids.sub_vendor_id == LSI_VENDOR_ID && (ids.sub_device_id & 0xff00) == 0xa000 {
                0xc010
            } else {
                0
            }
        }

        0x9050_10b5 | 0x5201_10b5 => 0x9050,
        0x9030_10b5 | 0x3001_10b5 | 0x30c1_10b5 => 0x9030,
        0x9080_10b5 | 0x0401_10b5 | 0x0860_10b5 => 0x9080,
        0x9054_10b5 | 0x5406_10b5 | 0x1860_10b5 | 0xc860_10b5 => 0x9054,
        0x9056_10b5 | 0x5601_10b5 | 0x56c2_10b5 => 0x9056,
        0x9656_10b5 | 0x9601_10b5 | 0x96c2_10b5 => 0x9656,
        0x8311_10b5 | 0x86e1_10b5 => 0x8311,

        // 6140/6152/6254(NT) share one ID; split on header type and VPD.
        0x0021_3388 => {
            if ids.header_type == 0 {
                0x6254
            } else {
                let reg = cfg.read_u32(0xa0);
                if (reg & 0xff) as u16 == PCI_CAP_ID_VPD {
                    0x6152
                } else {
                    0x6140
                }
            }
        }

        0x0022_3388 | 0x00a2_3388 => {
            if ids.revision == 0x20 {
                0x6350
            } else {
                0x6150
            }
        }

        0x0026_3388 => 0x6154,
        0x0031_3388 => 0x6156,
        0x0020_3388 => 0x6254,
        0x0030_3388 | 0x6520_10b5 => 0x6520,
        0x0028_3388 | 0x6540_10b5 | 0x0029_3388 | 0x6541_10b5 | 0x6542_10b5 => 0x6540,

        // Synthetic enabler EP & GEP: PCIe registers not reachable, the
        // subsystem ID carries the chip model.
        0x1008_10b5 | 0x1009_10b5 => ids.sub_device_id,

        _ => 0,
    }
}

/// Remaps raw PCI revision bytes to the marketing revision per model.
/// Unlisted models keep the raw revision; the mapping is deterministic and
/// idempotent for already-normalized values.
pub fn detect_revision(chip: u16, raw: u8) -> u8 {
    match chip {
        0x8111 => match raw {
            0x10 => 0xaa,
            0x20 => 0xba,
            0x21 => 0xbb,
            other => other,
        },
        0x8112 => 0xaa,
        0x9050 => {
            if raw == 0x2 {
                2
            } else {
                1
            }
        }
        0x9030 => 0xaa,
        0x9080 => 3,
        0x9054 => {
            // AA & AB silicon report the same raw revision.
            if raw == 0x1 || raw == 0xa || raw == 0xb || raw == 0xab {
                0xab
            } else {
                0xac
            }
        }
        0x8311 => 0xaa,
        0x6140 => match raw {
            // Revision 13h is the only other raw value seen in silicon.
            0x12 | 0xaa => 0xaa,
            _ => 0xda,
        },
        0x6150 => {
            if raw == 0x4 {
                0xbb
            } else {
                raw
            }
        }
        0x6152 => match raw {
            0x13 => 0xba,
            0x14 => 0xca,
            0x15 => 0xcc,
            0x16 => 0xda,
            other => other,
        },
        0x6154 | 0x6254 => {
            if raw == 0x4 {
                0xbb
            } else {
                raw
            }
        }
        0x6350 => {
            if raw == 0x20 {
                0xaa
            } else {
                raw
            }
        }
        0x6156 => {
            if raw == 0x1 {
                0xda
            } else {
                raw
            }
        }
        0x6520 | 0x6540 => {
            if raw == 0x2 {
                0xbb
            } else {
                raw
            }
        }
        _ => raw,
    }
}

/// Total, static model-to-family map. `device_id` and `revision`
/// disambiguate the models shared between two families.
pub fn family_of(chip: u16, device_id: u16, revision: u8) -> ChipFamily {
    match chip {
        0x9050 | 0x9030 | 0x9080 | 0x9054 | 0x9056 | 0x9656 | 0x8311 => ChipFamily::BridgeP2L,

        0x6140 | 0x6150 | 0x6152 | 0x6154 | 0x6156 | 0x6254 | 0x6350 | 0x6520 | 0x6540
        | 0x6466 => ChipFamily::BridgePciP2p,

        0x8111 | 0x8112 | 0x8114 => ChipFamily::BridgePcieP2p,

        0x8525 | 0x8533 | 0x8547 | 0x8548 => ChipFamily::Altair,
        0x8505 | 0x8509 => ChipFamily::AltairXl,
        0x8516 | 0x8524 | 0x8532 => ChipFamily::Vega,
        0x8508 | 0x8512 | 0x8517 | 0x8518 => ChipFamily::VegaLite,

        0x8612 | 0x8616 | 0x8624 | 0x8632 | 0x8647 | 0x8648 => ChipFamily::Deneb,

        0x8604 | 0x8606 | 0x8608 | 0x8609 | 0x8613 | 0x8614 | 0x8615 | 0x8617 | 0x8618
        | 0x8619 => ChipFamily::Sirius,

        0x8625 | 0x8636 | 0x8649 | 0x8664 | 0x8680 | 0x8696 => ChipFamily::Cygnus,

        // DMA functions report the bare 8700 model without a hard-coded ID.
        0x8700 => {
            if device_id == 0x87d0 || device_id == 0x87e0 {
                ChipFamily::Draco1
            } else {
                ChipFamily::Scout
            }
        }

        0x8712 | 0x8716 | 0x8723 | 0x8724 | 0x8732 | 0x8747 | 0x8748 => {
            if revision == 0xaa {
                ChipFamily::Draco1
            } else {
                ChipFamily::Draco2
            }
        }

        0x8713 | 0x8717 | 0x8725 | 0x8733 | 0x8749 => ChipFamily::Draco2,

        0x2380 | 0x3380 | 0x3382 | 0x8603 | 0x8605 => ChipFamily::Mira,

        0x8714 | 0x8718 | 0x8734 | 0x8750 | 0x8764 | 0x8780 | 0x8796 => ChipFamily::Capella1,

        0x8715 | 0x8719 | 0x8735 | 0x8751 | 0x8765 | 0x8781 | 0x8797 => ChipFamily::Capella2,

        0x9712 | 0x9713 | 0x9716 | 0x9717 | 0x9733 | 0x9734 | 0x9749 | 0x9750 | 0x9765
        | 0x9766 | 0x9781 | 0x9782 | 0x9797 | 0x9798 => ChipFamily::Capella2,

        0xc010 | 0xc011 | 0xc012 => ChipFamily::Atlas,

        0 => ChipFamily::None,

        other => {
            error!("no family mapping for chip {:04X}", other);
            ChipFamily::Unknown
        }
    }
}

/// Validates a dynamic chip-type override and reports whether the
/// register-access node must be re-pointed at the device itself
/// (upstream-only models).
pub(crate) fn validate_chip_override(chip: u16) -> Result<bool> {
    match generalize_for_dispatch(chip) {
        // 0 clears the chip type.
        0 | 0x6140 | 0x6150 | 0x6152 | 0x6154 | 0x6156 | 0x6254 | 0x6350 | 0x6520 | 0x6540
        | 0x8111 | 0x8112 => Ok(false),
        0x8114 | 0x8000 => Ok(true),
        _ => Err(Error::InvalidData),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeConfig;

    fn ids_of(cfg: &FakeConfig) -> IdentifyIds {
        cfg.identify_ids()
    }

    #[test]
    fn fallback_table_is_pure_and_exact() {
        // (vendor, device, header_type, revision) -> (chip, family)
        let cases: &[(u16, u16, u8, u8, u16, ChipFamily)] = &[
            (0x10b5, 0x9050, 0, 0x1, 0x9050, ChipFamily::BridgeP2L),
            (0x10b5, 0x5201, 0, 0x1, 0x9050, ChipFamily::BridgeP2L),
            (0x10b5, 0x9030, 0, 0xaa, 0x9030, ChipFamily::BridgeP2L),
            (0x10b5, 0x5406, 0, 0xb, 0x9054, ChipFamily::BridgeP2L),
            (0x10b5, 0x96c2, 0, 0x1, 0x9656, ChipFamily::BridgeP2L),
            (0x10b5, 0x86e1, 0, 0x1, 0x8311, ChipFamily::BridgeP2L),
            (0x3388, 0x0026, 1, 0x1, 0x6154, ChipFamily::BridgePciP2p),
            (0x3388, 0x0031, 1, 0x1, 0x6156, ChipFamily::BridgePciP2p),
            (0x3388, 0x0022, 1, 0x20, 0x6350, ChipFamily::BridgePciP2p),
            (0x3388, 0x0022, 1, 0x4, 0x6150, ChipFamily::BridgePciP2p),
            (0x10b5, 0x6541, 0, 0x2, 0x6540, ChipFamily::BridgePciP2p),
            (0x10b5, 0x8612, 1, 0xba, 0x8612, ChipFamily::Deneb),
            (0x10b5, 0x8624, 1, 0xbb, 0x8624, ChipFamily::Deneb),
            (0x1234, 0xabcd, 0, 0x1, 0, ChipFamily::None),
        ];

        for &(vendor, device, header, revision, chip, family) in cases {
            let mut cfg = FakeConfig::new(vendor, device);
            cfg.set_header_type(header);
            cfg.set_revision(revision);
            let id = identify(&cfg, &ids_of(&cfg));
            assert_eq!(id.chip, chip, "{:04x}:{:04x}", vendor, device);
            assert_eq!(id.family, family, "{:04x}:{:04x}", vendor, device);
            // Purity: same inputs, same answer.
            let again = identify(&cfg, &ids_of(&cfg));
            assert_eq!(id, again);
        }
    }

    #[test]
    fn vpd_splits_6152_from_6140() {
        let mut cfg = FakeConfig::new(0x3388, 0x0021);
        cfg.set_header_type(1);
        assert_eq!(identify(&cfg, &ids_of(&cfg)).chip, 0x6140);

        let mut cfg = FakeConfig::new(0x3388, 0x0021);
        cfg.set_header_type(1);
        cfg.write_u32(0xa0, PCI_CAP_ID_VPD as u32);
        assert_eq!(identify(&cfg, &ids_of(&cfg)).chip, 0x6152);

        let mut cfg = FakeConfig::new(0x3388, 0x0021);
        cfg.set_header_type(0);
        assert_eq!(identify(&cfg, &ids_of(&cfg)).chip, 0x6254);
    }

    #[test]
    fn hardcoded_id_wins_over_fallback() {
        let mut cfg = FakeConfig::new(0x10b5, 0x8613);
        cfg.set_revision(0x01);
        cfg.add_pci_vsec(0x8613, 0xba, 1);
        let id = identify(&cfg, &ids_of(&cfg));
        assert_eq!(id.chip, 0x8613);
        assert_eq!(id.revision, 0xba);
        assert_eq!(id.family, ChipFamily::Sirius);
    }

    #[test]
    fn stale_revision_models_keep_pci_revision() {
        for &chip in &STALE_HARDCODED_REVISION {
            let mut cfg = FakeConfig::new(0x10b5, chip);
            cfg.set_revision(0xba);
            // Hard-coded revision register deliberately reports garbage.
            cfg.add_pci_vsec(chip, 0x77, 1);
            let id = identify(&cfg, &ids_of(&cfg));
            assert_eq!(id.chip, chip);
            assert_eq!(id.revision, 0xba, "chip {:04x}", chip);
        }
    }

    #[test]
    fn pcie_vsec_and_atlas_normalization() {
        let mut cfg = FakeConfig::new(0x1000, 0xc012);
        cfg.set_revision(0xb0);
        cfg.add_ext_vsec(0xc012, 0xaa);
        let id = identify(&cfg, &ids_of(&cfg));
        assert_eq!(id.chip, 0xc012);
        // AAh on a C0xx model normalizes to A0h.
        assert_eq!(id.revision, 0xa0);
        assert_eq!(id.family, ChipFamily::Atlas);
    }

    #[test]
    fn mpt_placeholder_model_recovers_from_ids() {
        let mut cfg = FakeConfig::new(0x1000, 0xc011);
        cfg.add_ext_vsec(0x00b2, 0xb0);
        assert_eq!(identify(&cfg, &ids_of(&cfg)).chip, 0xc011);

        let mut cfg = FakeConfig::new(0x1000, 0x00b2);
        cfg.set_sub_ids(0x1000, 0xc010);
        cfg.add_ext_vsec(0x00b2, 0xb0);
        assert_eq!(identify(&cfg, &ids_of(&cfg)).chip, 0xc010);

        let mut cfg = FakeConfig::new(0x1000, 0x00b2);
        cfg.add_ext_vsec(0x00b2, 0xb0);
        assert_eq!(identify(&cfg, &ids_of(&cfg)).chip, 0xc012);
    }

    #[test]
    fn intel_vsec_is_ignored() {
        let mut cfg = FakeConfig::new(INTEL_VENDOR_ID, 0x1234);
        cfg.add_ext_vsec(0x8648, 0xaa);
        let id = identify(&cfg, &ids_of(&cfg));
        assert_eq!(id.chip, 0);
        assert_eq!(id.family, ChipFamily::None);
    }

    #[test]
    fn extended_region_aliasing_is_ignored() {
        let mut cfg = FakeConfig::new(0x8765, 0x4321);
        // Chipset pass-through echoes the device's own Dev/Ven ID at 100h.
        cfg.write_u32(0x100, 0x4321_8765);
        let id = identify(&cfg, &ids_of(&cfg));
        assert_eq!(id.chip, 0);
    }

    #[test]
    fn detect_revision_is_idempotent() {
        for &(chip, raw) in &[
            (0x9054u16, 0x1u8),
            (0x9054, 0x5),
            (0x6152, 0x13),
            (0x6152, 0x14),
            (0x6152, 0x15),
            (0x6152, 0x16),
            (0x8111, 0x20),
            (0x6140, 0x12),
            (0x6140, 0x13),
        ] {
            let once = detect_revision(chip, raw);
            assert_eq!(once, detect_revision(chip, once), "chip {:04x}", chip);
        }
        assert_eq!(detect_revision(0x9054, 0xa), 0xab);
        assert_eq!(detect_revision(0x9054, 0x5), 0xac);
        assert_eq!(detect_revision(0x6152, 0x16), 0xda);
    }

    #[test]
    fn shared_models_disambiguate() {
        // 8700: DMA device IDs mean Draco-1, everything else Scout.
        assert_eq!(family_of(0x8700, 0x87d0, 0), ChipFamily::Draco1);
        assert_eq!(family_of(0x8700, 0x87e0, 0), ChipFamily::Draco1);
        assert_eq!(family_of(0x8700, 0x8700, 0), ChipFamily::Scout);
        // 8712-class: revision AA is Draco-1 silicon.
        assert_eq!(family_of(0x8732, 0x8732, 0xaa), ChipFamily::Draco1);
        assert_eq!(family_of(0x8732, 0x8732, 0xab), ChipFamily::Draco2);
        // Unmapped non-zero model is Unknown, not fatal.
        assert_eq!(family_of(0x1111, 0x1111, 0), ChipFamily::Unknown);
    }
}
