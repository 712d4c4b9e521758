// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device list construction and PCI/PCIe topology resolution.
//!
//! The list is built once from a backend scan and owns one node per PCI
//! function. Cross-node edges (parent bridge, register-access node) are
//! index-based references into the list rather than pointers, and all
//! mutation goes through `&mut DeviceList`.

use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use std::sync::OnceLock;

use bitflags::bitflags;
use enumn::N;
use log::debug;
use log::error;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::backend::PciBackend;
use crate::backend::PciFunctionInfo;
use crate::backend::RegisterIo;
use crate::chip;
use crate::chip::ChipFamily;
use crate::chip::ChipIdentity;
use crate::chip::IdentifyIds;
use crate::pci::find_capability;
use crate::pci::ConfigAccess;
use crate::pci::PciAddress;
use crate::pci::PCI_CAP_ID_BRIDGE_SUB_ID;
use crate::pci::PCI_CAP_ID_PCI_EXPRESS;
use crate::pci::PCI_CFG_RD_ERR_VAL;
use crate::pci::PCI_REG_BAR_0;
use crate::pci::PCI_REG_CLASS_REV;
use crate::pci::PCI_REG_CMD_STAT;
use crate::pci::PCI_REG_DEV_VEN_ID;
use crate::pci::PCI_REG_HDR_CACHE_LN;
use crate::pci::PCI_REG_INT_PIN_LINE;
use crate::pci::PCI_REG_T1_PRIM_SEC_BUS;
use crate::pci::PCI_REG_TO_SUBSYS_ID;
use crate::pci::PLX_VENDOR_ID;
use crate::Error;
use crate::Result;

/// Index of a node within a [`DeviceList`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// PCIe device/port type from the 4-bit PCIe capability field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, N, Serialize, Deserialize)]
#[repr(u8)]
pub enum PciePortType {
    Endpoint = 0,
    LegacyEndpoint = 1,
    RootPort = 4,
    Upstream = 5,
    Downstream = 6,
    PcieToPciBridge = 7,
    PciToPcieBridge = 8,
    RootEndpoint = 9,
    RootEventCollector = 10,
    Unknown = 0xff,
}

/// PLX-specific role of a port within the switch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum PortType {
    #[default]
    Unknown,
    NtVirtual,
    NtLink,
    Upstream,
    Downstream,
    P2pBridge,
    LegacyEp,
    Dma,
    Host,
    Fabric,
    Gep,
    SynthEnabler,
    SynthNt,
    SynthNic,
    SynthTwc,
    SynthGdma,
}

impl PortType {
    pub fn is_nt(&self) -> bool {
        matches!(self, PortType::NtVirtual | PortType::NtLink)
    }
}

/// Operating mode of the chip a function belongs to.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChipMode {
    #[default]
    Unknown,
    Standard,
    VirtualSwitch,
    Fabric,
    /// Mira switch + USB endpoint ("enhanced") mode.
    Enhanced,
    /// Mira USB root endpoint ("legacy adapter") mode.
    LegacyAdapter,
}

/// Identity of one PCI function plus its resolved PLX identity.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceKey {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub sub_vendor_id: u16,
    pub sub_device_id: u16,
    pub revision: u8,
    pub chip: ChipIdentity,
    pub port_type: PortType,
    pub mode: ChipMode,
}

bitflags! {
    /// BAR attribute bits, decoded once at probe time.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct BarFlags: u32 {
        const IO = 1 << 0;
        const MEM = 1 << 1;
        const BELOW_1MB = 1 << 2;
        const BITS_32 = 1 << 3;
        const BITS_64 = 1 << 4;
        const PREFETCHABLE = 1 << 5;
        /// Upper half of a 64-bit BAR; never independently mappable.
        const UPPER_32 = 1 << 6;
        const PROBED = 1 << 7;
    }
}

/// Decoded properties of one BAR.
#[derive(Copy, Clone, Debug, Default)]
pub struct BarProperties {
    pub bar_value: u64,
    pub physical: u64,
    pub size: u64,
    pub flags: BarFlags,
}

/// One BAR slot: decoded properties plus the lazily created kernel mapping.
#[derive(Default)]
pub struct PciBar {
    pub properties: BarProperties,
    mapping: OnceLock<Arc<dyn RegisterIo>>,
}

/// Everything needed to hand a BAR to a host-specific mapping mechanism.
#[derive(Copy, Clone, Debug)]
pub struct BarMapping {
    pub physical: u64,
    pub size: u64,
    /// Whether write-combining/cached mappings are acceptable.
    pub cacheable: bool,
}

/// PCIe port status read from the PCIe capability.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct PortProperties {
    pub port_type: PciePortType,
    pub port_number: u8,
    pub link_width: u8,
    pub max_link_width: u8,
    pub link_speed: u8,
    pub max_link_speed: u8,
    pub max_payload_size: u16,
    pub max_payload_supported: u16,
    pub max_read_req_size: u16,
    pub non_pcie_device: bool,
}

impl Default for PortProperties {
    fn default() -> Self {
        PortProperties {
            port_type: PciePortType::Unknown,
            port_number: 0,
            link_width: 0,
            max_link_width: 0,
            link_speed: 0,
            max_link_speed: 0,
            max_payload_size: 0,
            max_payload_supported: 0,
            max_read_req_size: 0,
            non_pcie_device: false,
        }
    }
}

/// One discovered PCI function.
pub struct DeviceNode {
    pub key: DeviceKey,
    pub header_type: u8,
    /// 24-bit class code.
    pub class_code: u32,
    pub bars: [PciBar; 6],
    /// Bridge whose secondary bus this function lives on.
    pub parent: Option<NodeId>,
    /// Device whose BAR 0 carries this function's internal registers.
    pub(crate) reg_node: Option<NodeId>,
    pub(crate) config: Arc<dyn ConfigAccess>,
    pub(crate) port_number: OnceLock<u8>,
    /// Base of this port's NT register block inside BAR 0.
    pub(crate) nt_reg_base: u32,
    pub(crate) default_eeprom_width: AtomicU8,
}

impl DeviceNode {
    pub fn config(&self) -> &dyn ConfigAccess {
        &*self.config
    }

    /// Register-access node, once topology setup resolved one.
    pub fn register_node(&self) -> Option<NodeId> {
        self.reg_node
    }

    pub fn nt_register_base(&self) -> u32 {
        self.nt_reg_base
    }
}

/// Wildcard-capable device match criteria; `None` fields match anything.
#[derive(Copy, Clone, Debug, Default)]
pub struct KeyMatch {
    pub domain: Option<u16>,
    pub bus: Option<u8>,
    pub slot: Option<u8>,
    pub function: Option<u8>,
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
    pub sub_vendor_id: Option<u16>,
    pub sub_device_id: Option<u16>,
    pub revision: Option<u8>,
}

impl KeyMatch {
    fn matches(&self, key: &DeviceKey) -> bool {
        self.domain.map_or(true, |v| v == key.address.domain)
            && self.bus.map_or(true, |v| v == key.address.bus)
            && self.slot.map_or(true, |v| v == key.address.dev)
            && self.function.map_or(true, |v| v == key.address.func)
            && self.vendor_id.map_or(true, |v| v == key.vendor_id)
            && self.device_id.map_or(true, |v| v == key.device_id)
            && self.sub_vendor_id.map_or(true, |v| v == key.sub_vendor_id)
            && self.sub_device_id.map_or(true, |v| v == key.sub_device_id)
            && self.revision.map_or(true, |v| v == key.revision)
    }
}

/// Reserved endpoint device IDs used by fabric-capable chips for
/// synthetic/virtualized functions.
const DEVICE_ID_SYNTH_ENABLER: u16 = 0x1008;
const DEVICE_ID_GEP: u16 = 0x1009;
const DEVICE_ID_SYNTH_NT: u16 = 0x100a;
const DEVICE_ID_SYNTH_NIC: u16 = 0x100b;
const DEVICE_ID_SYNTH_TWC: u16 = 0x100c;
const DEVICE_ID_SYNTH_GDMA: u16 = 0x100d;

/// Legacy DMA controllers appear as extra functions with this class code.
const CLASS_CODE_OTHER_SYSTEM_PERIPHERAL: u32 = 0x088000;
/// NT endpoints appear with this "other bridge" class code.
const CLASS_CODE_OTHER_BRIDGE: u32 = 0x068000;

/// The device list: one node per discovered PCI function.
pub struct DeviceList {
    nodes: Vec<DeviceNode>,
    backend: Arc<dyn PciBackend>,
}

impl DeviceList {
    /// Scans the bus and builds the fully resolved device list.
    pub fn scan(backend: Arc<dyn PciBackend>) -> Result<DeviceList> {
        let functions = backend.scan()?;
        let mut nodes = Vec::with_capacity(functions.len());
        for function in functions {
            nodes.push(build_node(&*backend, function));
        }
        let mut list = DeviceList { nodes, backend };
        list.build_topology();
        debug!("device scan: {} function(s) found", list.nodes.len());
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&DeviceNode> {
        self.nodes.get(id.0)
    }

    pub fn node(&self, id: NodeId) -> &DeviceNode {
        &self.nodes[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &DeviceNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Finds the `nth` device matching `criteria`.
    pub fn find(&self, criteria: &KeyMatch, nth: u16) -> Result<NodeId> {
        let mut count = 0;
        for (id, node) in self.iter() {
            if criteria.matches(&node.key) {
                if count == nth {
                    return Ok(id);
                }
                count += 1;
            }
        }
        Err(Error::NotFound)
    }

    /// Number of devices matching `criteria`.
    pub fn match_count(&self, criteria: &KeyMatch) -> u16 {
        self.iter()
            .filter(|(_, n)| criteria.matches(&n.key))
            .count() as u16
    }

    pub fn chip_type(&self, id: NodeId) -> ChipIdentity {
        self.node(id).key.chip
    }

    /// Overrides the chip type of a device, re-deriving revision and family.
    ///
    /// A `chip` of 0 re-runs auto-detection. `revision` of `None` (or 0)
    /// re-derives the revision from the PCI config value.
    pub fn set_chip_type(
        &mut self,
        id: NodeId,
        chip: u16,
        revision: Option<u8>,
    ) -> Result<ChipIdentity> {
        let mut chip = chip;
        if chip == 0 {
            let node = self.node(id);
            let detected = chip::identify(&*node.config, &identify_ids(node));
            chip = detected.chip;
        }

        let set_self_node = chip::validate_chip_override(chip)?;

        // Generic 8000-class overrides only make sense on the upstream port.
        if chip::generalize_for_dispatch(chip) == 0x8000 && chip != 0x8114 {
            let props = self.port_properties(id)?;
            if props.port_type != PciePortType::Upstream {
                error!("chip type may only be changed on an upstream port");
                return Err(Error::Unsupported);
            }
        }

        let node = &mut self.nodes[id.0];
        node.key.chip.chip = chip;
        match revision {
            Some(r) if r != 0 && r != 0xff => node.key.chip.revision = r,
            _ => node.key.chip.revision = chip::detect_revision(chip, node.key.revision),
        }
        node.key.chip.family = chip::family_of(chip, node.key.device_id, node.key.chip.revision);
        node.reg_node = if set_self_node { Some(id) } else { None };

        debug!(
            "set device {} type to {:04X} rev {:02X}",
            node.key.address, node.key.chip.chip, node.key.chip.revision
        );
        Ok(node.key.chip)
    }

    /// Reads the current PCIe port status of a device.
    pub fn port_properties(&self, id: NodeId) -> Result<PortProperties> {
        let node = self.node(id);
        let cfg = &*node.config;
        let mut props = PortProperties::default();

        let pcie_cap = find_capability(cfg, PCI_CAP_ID_PCI_EXPRESS, false, 0);
        if pcie_cap == 0 {
            props.non_pcie_device = true;
            props.port_type = if node.header_type == 0 {
                PciePortType::LegacyEndpoint
            } else {
                PciePortType::Unknown
            };
            return Ok(props);
        }
        let pcie_cap = u32::from(pcie_cap);

        let reg = cfg.read_u32(pcie_cap);
        props.port_type =
            PciePortType::n(((reg >> 20) & 0xf) as u8).unwrap_or(PciePortType::Unknown);

        // Device capabilities: supported payload is 128 * 2^field.
        let reg = cfg.read_u32(pcie_cap + 0x04);
        let field = (reg & 0x7) as u16;
        if field <= 5 {
            props.max_payload_supported = 128 << field;
        }

        // Device control: negotiated payload & read request sizes.
        let reg = cfg.read_u32(pcie_cap + 0x08);
        let field = ((reg >> 5) & 0x7) as u16;
        if field <= 5 {
            props.max_payload_size = 128 << field;
        }
        let field = ((reg >> 12) & 0x7) as u16;
        if field <= 5 {
            props.max_read_req_size = 128 << field;
        }

        // Link capabilities.
        let reg = cfg.read_u32(pcie_cap + 0x0c);
        props.port_number = (reg >> 24) as u8;
        props.max_link_width = ((reg >> 4) & 0x3f) as u8;
        props.max_link_speed = (reg & 0xf) as u8;

        // Link status.
        let reg = cfg.read_u32(pcie_cap + 0x10);
        props.link_width = ((reg >> 20) & 0x3f) as u8;
        props.link_speed = ((reg >> 16) & 0xf) as u8;

        // Mira 3300 enhanced mode reports x0 link width for the DS port
        // and USB EP; override with the maximum width.
        if node.key.chip.family == ChipFamily::Mira
            && (node.key.chip.chip & 0xff00) == 0x3300
            && node.key.mode == ChipMode::Enhanced
            && props.link_width == 0
        {
            warn!(
                "overriding reported link width (x{}) with max width (x{})",
                props.link_width, props.max_link_width
            );
            props.link_width = props.max_link_width;
        }

        // Under port bifurcation Draco-2 DS ports can report the wrong
        // port number; the slot number is authoritative.
        if node.key.chip.family == ChipFamily::Draco2
            && props.port_type == PciePortType::Downstream
            && props.port_number != node.key.address.dev
        {
            warn!(
                "overriding reported port number ({}) with slot number ({})",
                props.port_number, node.key.address.dev
            );
            props.port_number = node.key.address.dev;
        }

        let _ = node.port_number.set(props.port_number);

        Ok(props)
    }

    /// Returns the decoded properties of one BAR.
    pub fn bar_properties(&self, id: NodeId, bar: usize) -> Result<BarProperties> {
        let node = self.node(id);
        validate_bar_index(node.header_type, bar)?;
        Ok(node.bars[bar].properties)
    }

    /// Resolves a BAR into what a host mapping mechanism needs.
    ///
    /// Refuses I/O BARs and the upper halves of 64-bit BARs.
    pub fn resolve_bar_for_mapping(&self, id: NodeId, bar: usize) -> Result<BarMapping> {
        let node = self.node(id);
        validate_bar_index(node.header_type, bar)?;
        let props = node.bars[bar].properties;
        if props.flags.contains(BarFlags::UPPER_32) {
            return Err(Error::InvalidIndex);
        }
        if props.flags.contains(BarFlags::IO) || !props.flags.contains(BarFlags::MEM) {
            return Err(Error::InvalidAccess);
        }
        if props.physical == 0 || props.size == 0 {
            return Err(Error::InsufficientResources);
        }
        Ok(BarMapping {
            physical: props.physical,
            size: props.size,
            cacheable: props.flags.contains(BarFlags::PREFETCHABLE),
        })
    }

    /// Maps a BAR (or returns the cached mapping).
    pub(crate) fn map_bar(&self, id: NodeId, bar: usize) -> Result<Arc<dyn RegisterIo>> {
        let node = self.node(id);
        validate_bar_index(node.header_type, bar)?;
        if let Some(io) = node.bars[bar].mapping.get() {
            return Ok(io.clone());
        }
        let mapping = self.resolve_bar_for_mapping(id, bar)?;
        let io = self.backend.map_bar(node.key.address, bar).map_err(|e| {
            error!(
                "unable to map BAR {} of {} ({:#x}, {} bytes): {}",
                bar, node.key.address, mapping.physical, mapping.size, e
            );
            Error::InsufficientResources
        })?;
        debug!("mapped BAR {} of {}", bar, node.key.address);
        let _ = node.bars[bar].mapping.set(io);
        Ok(node.bars[bar].mapping.get().unwrap().clone())
    }

    /// Drops every cached BAR mapping (the "last closer" release path).
    pub fn unmap_all_bars(&mut self) {
        for node in &mut self.nodes {
            for bar in &mut node.bars {
                bar.mapping = OnceLock::new();
            }
        }
    }

    /// Resolves the register-access node for `id` to a fixed point.
    ///
    /// Register-node edges can be rebound as later devices are discovered,
    /// so each access chases the chain; convergence is bounded by the
    /// topology depth.
    pub(crate) fn resolve_reg_node(&self, id: NodeId) -> Result<NodeId> {
        let mut current = self.node(id).reg_node.ok_or(Error::InvalidData)?;
        for _ in 0..=self.nodes.len() {
            match self.node(current).reg_node {
                Some(next) if next != current => current = next,
                _ => return Ok(current),
            }
        }
        Ok(current)
    }

    /// Removes ports that are disabled in hardware from `port_mask`.
    pub fn filter_disabled_ports(&self, id: NodeId, port_mask: &mut u64) -> Result<()> {
        let node = self.node(id);
        let max_ports = 24u8;
        let offset = match node.key.chip.family {
            ChipFamily::Altair
            | ChipFamily::AltairXl
            | ChipFamily::Vega
            | ChipFamily::VegaLite
            | ChipFamily::Deneb
            | ChipFamily::Sirius => 0x668,
            ChipFamily::Mira => 0x1d8,
            ChipFamily::Cygnus | ChipFamily::Scout | ChipFamily::Draco1 | ChipFamily::Draco2 => {
                0x314
            }
            ChipFamily::Capella1 | ChipFamily::Capella2 => {
                if node.key.mode == ChipMode::Standard {
                    0xf4c
                } else {
                    0x30c
                }
            }
            _ => {
                error!(
                    "disabled-port filter not implemented for {:04X}",
                    node.key.chip.chip
                );
                return Err(Error::Unsupported);
            }
        };

        let enabled = self.plx_reg_read(id, offset, false)?;
        let chip_mask = (1u64 << max_ports) - 1;
        let enabled = u64::from(enabled) & chip_mask & *port_mask;
        *port_mask = (*port_mask & !chip_mask) | enabled;
        Ok(())
    }

    /// One-time topology resolution over the freshly scanned list.
    fn build_topology(&mut self) {
        let count = self.nodes.len();

        // Parent bridge: the type-1 header owning this node's bus.
        let parents: Vec<Option<NodeId>> =
            (0..count).map(|i| self.find_parent(NodeId(i))).collect();
        for (i, parent) in parents.into_iter().enumerate() {
            self.nodes[i].parent = parent;
        }

        // Register-access node resolution.
        for i in 0..count {
            let reg_node = self.setup_register_access(NodeId(i));
            self.nodes[i].reg_node = reg_node;
        }

        // Mira runs either as a USB legacy adapter or as switch + EP; the
        // distinction moves several register blocks, so settle it early.
        for i in 0..count {
            if self.nodes[i].key.chip.family != ChipFamily::Mira {
                continue;
            }
            let mode = if self.nodes[i].header_type == 1 {
                ChipMode::Enhanced
            } else {
                match self.plx_reg_read(NodeId(i), 0x90, false) {
                    Ok(reg) if reg & (1 << 11) != 0 => ChipMode::Enhanced,
                    Ok(_) => ChipMode::LegacyAdapter,
                    Err(_) => ChipMode::Unknown,
                }
            };
            self.nodes[i].key.mode = mode;
        }

        // PLX-specific port classification, including the NT-side probe.
        for i in 0..count {
            let (port_type, nt_reg_base) = self.classify_port(NodeId(i));
            let node = &mut self.nodes[i];
            node.key.port_type = port_type;
            node.nt_reg_base = nt_reg_base;
        }

        // A GEP only exists on fabric-mode chips, and its grandparent
        // upstream port must borrow the GEP's BAR 0 for register access.
        for i in 0..count {
            if self.nodes[i].key.port_type != PortType::Gep {
                continue;
            }
            self.nodes[i].key.mode = ChipMode::Fabric;
            let grandparent = self.nodes[i]
                .parent
                .and_then(|p| self.node(p).parent)
                .filter(|gp| self.node(*gp).key.port_type == PortType::Upstream);
            if let Some(gp) = grandparent {
                debug!(
                    "fabric GEP {}: redirecting upstream {} register access",
                    self.nodes[i].key.address,
                    self.node(gp).key.address
                );
                self.nodes[gp.0].reg_node = Some(NodeId(i));
            }
        }
    }

    fn find_parent(&self, id: NodeId) -> Option<NodeId> {
        let bus = self.node(id).key.address.bus;
        for (candidate, node) in self.iter() {
            if candidate == id || node.header_type != 1 {
                continue;
            }
            let reg = node.config.read_u32(PCI_REG_T1_PRIM_SEC_BUS);
            if reg == PCI_CFG_RD_ERR_VAL {
                continue;
            }
            let secondary = (reg >> 8) as u8;
            if secondary == bus {
                return Some(candidate);
            }
        }
        None
    }

    /// Chooses the node whose BAR 0 carries this function's registers.
    ///
    /// A device with its own enabled BAR 0 is self-referencing; otherwise
    /// walk up the parent chain while the chip model matches. A differing
    /// ancestor chip stops the walk and access falls back to the caller's
    /// own BAR 0.
    fn setup_register_access(&self, id: NodeId) -> Option<NodeId> {
        let node = self.node(id);

        if node.key.chip.descriptor().reg_protocol != chip::RegProtocol::MemoryMapped {
            return Some(id);
        }

        let bar0 = node.config.read_u32(PCI_REG_BAR_0);
        if bar0 != 0 && bar0 != PCI_CFG_RD_ERR_VAL {
            return Some(id);
        }

        let mut current = node.parent;
        let mut hops = 0;
        while let Some(ancestor_id) = current {
            if hops > self.nodes.len() {
                break;
            }
            let ancestor = self.node(ancestor_id);
            if ancestor.key.chip.chip != node.key.chip.chip {
                // Crossed into a different chip; use our own BAR 0.
                return Some(id);
            }
            let ancestor_bar0 = ancestor.config.read_u32(PCI_REG_BAR_0);
            if (ancestor_bar0 != 0 && ancestor_bar0 != PCI_CFG_RD_ERR_VAL)
                || ancestor
                    .reg_node
                    .is_some_and(|r| r != ancestor_id && r != id)
            {
                return Some(ancestor_id);
            }
            current = ancestor.parent;
            hops += 1;
        }

        error!(
            "register access setup failed for {}: no ancestor with BAR 0",
            node.key.address
        );
        None
    }

    /// Ordered classification chain for the PLX-specific port role.
    fn classify_port(&self, id: NodeId) -> (PortType, u32) {
        let node = self.node(id);
        let key = &node.key;

        if key.vendor_id == PLX_VENDOR_ID || key.vendor_id == crate::pci::LSI_VENDOR_ID {
            match key.device_id {
                DEVICE_ID_GEP => return (PortType::Gep, 0),
                DEVICE_ID_SYNTH_ENABLER => return (PortType::SynthEnabler, 0),
                DEVICE_ID_SYNTH_NT => return (PortType::SynthNt, 0),
                DEVICE_ID_SYNTH_NIC => return (PortType::SynthNic, 0),
                DEVICE_ID_SYNTH_TWC => return (PortType::SynthTwc, 0),
                DEVICE_ID_SYNTH_GDMA => return (PortType::SynthGdma, 0),
                _ => {}
            }
        }

        // Extra functions with the system-peripheral class are the chip's
        // legacy DMA controllers.
        if node.class_code == CLASS_CODE_OTHER_SYSTEM_PERIPHERAL && key.address.func >= 1 {
            return (PortType::Dma, 0);
        }

        // NT endpoints carry the "other bridge" class on a type-0 header
        // and need a live probe to tell the virtual side from the link
        // side.
        if node.header_type == 0
            && node.class_code == CLASS_CODE_OTHER_BRIDGE
            && key.address.func == 0
            && nt_capable(key.chip.chip)
        {
            if let Some(result) = self.determine_nt_port_side(id) {
                return result;
            }
        }

        let props = match self.port_properties(id) {
            Ok(props) => props,
            Err(_) => return (PortType::Unknown, 0),
        };

        match props.port_type {
            PciePortType::Upstream => (PortType::Upstream, 0),
            PciePortType::Downstream | PciePortType::RootPort => (PortType::Downstream, 0),
            PciePortType::PcieToPciBridge | PciePortType::PciToPcieBridge => {
                (PortType::P2pBridge, 0)
            }
            PciePortType::Endpoint | PciePortType::LegacyEndpoint => (PortType::LegacyEp, 0),
            _ => (PortType::Unknown, 0),
        }
    }

    /// Determines whether an NT endpoint is the virtual or the link side,
    /// and the base of its NT register block.
    fn determine_nt_port_side(&self, id: NodeId) -> Option<(PortType, u32)> {
        let node = self.node(id);
        let key = &node.key;

        // 6000-series NT: the device ID's low bit encodes the side.
        if (key.chip.chip & 0xf000) == 0x6000 {
            return if key.device_id & 1 != 0 {
                Some((PortType::NtVirtual, 0))
            } else {
                Some((PortType::NtLink, 0))
            };
        }

        let bar0 = node.config.read_u32(PCI_REG_BAR_0);
        if bar0 == 0 {
            // BAR 0 disabled: 8500-style virtual side.
            return Some((PortType::NtVirtual, 0x10000));
        }

        let mut base;
        let mut side = None;
        match key.chip.family {
            ChipFamily::Scout | ChipFamily::Draco2 | ChipFamily::Capella1 => {
                // NT ID register names the port and the side directly.
                let reg = node.config.read_u32(0xc8c);
                base = if reg & 1 != 0 { 0x3c000 } else { 0x3e000 };
                side = Some(if reg & (1 << 31) != 0 {
                    PortType::NtLink
                } else {
                    PortType::NtVirtual
                });
            }
            // Draco-1 has no NT ID register; probe below.
            ChipFamily::Draco1 | ChipFamily::Cygnus => base = 0x3e000,
            _ => {
                if matches!(key.chip.chip & 0xff00, 0x8500 | 0x8600) {
                    base = 0x10000;
                } else {
                    error!("NT side detection not implemented for {:04X}", key.chip.chip);
                    return None;
                }
            }
        }

        let side = match side {
            Some(side) => side,
            None => self.probe_nt_side(id, base),
        };

        if side == PortType::NtLink {
            base += 0x1000;
        }

        debug!(
            "{:04X} NT port {} is {}-side (NT base {:X}h)",
            key.chip.chip,
            key.address,
            if side == PortType::NtLink { "link" } else { "virtual" },
            base
        );
        Some((side, base))
    }

    /// Sentinel-write probe for chips that do not report the NT side.
    ///
    /// Writes FEh into the low byte of the interrupt pin/line register
    /// through the mapped BAR, then re-reads that register through an
    /// uncached configuration cycle. Only the virtual side observes the
    /// write; on the link side the window updates a different underlying
    /// register.
    fn probe_nt_side(&self, id: NodeId, nt_base: u32) -> PortType {
        let reg_node = match self.resolve_reg_node(id) {
            Ok(r) => r,
            Err(_) => return PortType::NtVirtual,
        };
        let io = match self.map_bar(reg_node, 0) {
            Ok(io) => io,
            Err(e) => {
                warn!("NT probe skipped, BAR 0 unavailable: {}", e);
                return PortType::NtVirtual;
            }
        };
        let node = self.node(id);
        let offset = u64::from(nt_base) + u64::from(PCI_REG_INT_PIN_LINE);
        if offset + 4 > io.len() {
            return PortType::NtVirtual;
        }

        let saved = io.read_u32(offset);
        let expected = (saved & !0xff) | 0xfe;
        io.write_u32(offset, expected);
        // Updates can take a moment to propagate to config space; dummy
        // reads cover the latency.
        io.read_u32(offset);
        io.read_u32(offset);

        let pci = node.config.read_u32_uncached(PCI_REG_INT_PIN_LINE);
        io.write_u32(offset, saved);

        if pci == expected {
            PortType::NtVirtual
        } else {
            PortType::NtLink
        }
    }
}

/// Chips whose NT ports require side determination.
fn nt_capable(chip: u16) -> bool {
    (chip & 0xf000) == 0x6000 || matches!(chip & 0xff00, 0x8500 | 0x8600 | 0x8700)
}

fn validate_bar_index(header_type: u8, bar: usize) -> Result<()> {
    match header_type {
        0 => {
            if bar > 5 {
                return Err(Error::InvalidIndex);
            }
        }
        1 => {
            if bar > 1 {
                return Err(Error::InvalidIndex);
            }
        }
        _ => return Err(Error::InvalidIndex),
    }
    Ok(())
}

fn identify_ids(node: &DeviceNode) -> IdentifyIds {
    IdentifyIds {
        vendor_id: node.key.vendor_id,
        device_id: node.key.device_id,
        sub_vendor_id: node.key.sub_vendor_id,
        sub_device_id: node.key.sub_device_id,
        revision: node.key.revision,
        header_type: node.header_type,
    }
}

/// Builds one node from a scanned function: IDs, BAR probe, chip identity.
fn build_node(backend: &dyn PciBackend, function: PciFunctionInfo) -> DeviceNode {
    let config = function.config;
    let cfg = &*config;

    let dev_ven = cfg.read_u32(PCI_REG_DEV_VEN_ID);
    let vendor_id = dev_ven as u16;
    let device_id = (dev_ven >> 16) as u16;

    let class_rev = cfg.read_u32(PCI_REG_CLASS_REV);
    let revision = class_rev as u8;
    let class_code = class_rev >> 8;

    let header_type = ((cfg.read_u32(PCI_REG_HDR_CACHE_LN) >> 16) & 0x7f) as u8;

    let (mut sub_vendor_id, mut sub_device_id) = if header_type == 0 {
        let reg = cfg.read_u32(PCI_REG_TO_SUBSYS_ID);
        (reg as u16, (reg >> 16) as u16)
    } else {
        (0, 0)
    };

    // Firmware may leave PLX devices unenabled; enable without disturbing
    // any latched PCI error status.
    if vendor_id == PLX_VENDOR_ID {
        let cmd = cfg.read_u32(PCI_REG_CMD_STAT);
        if cmd != PCI_CFG_RD_ERR_VAL && cmd & 0x7 == 0 {
            cfg.write_u32(PCI_REG_CMD_STAT, (cmd & !(0x1f << 27)) | 0x7);
        }
    }

    // Upstream/downstream ports carry their subsystem ID in a capability.
    if vendor_id == PLX_VENDOR_ID && header_type == 1 {
        let offset = find_capability(cfg, PCI_CAP_ID_BRIDGE_SUB_ID, false, 0);
        if offset != 0 {
            let reg = cfg.read_u32(u32::from(offset) + 0x04);
            sub_vendor_id = reg as u16;
            sub_device_id = (reg >> 16) as u16;
        }
    }

    let ids = IdentifyIds {
        vendor_id,
        device_id,
        sub_vendor_id,
        sub_device_id,
        revision,
        header_type,
    };
    let chip = chip::identify(cfg, &ids);

    let bars = probe_bars(backend, function.address, cfg, header_type, chip.chip != 0);

    debug!(
        "add {:04X} {:04X} [{}] chip {:04X} rev {:02X} ({})",
        device_id, vendor_id, function.address, chip.chip, chip.revision, chip.family
    );

    DeviceNode {
        key: DeviceKey {
            address: function.address,
            vendor_id,
            device_id,
            sub_vendor_id,
            sub_device_id,
            revision,
            chip,
            port_type: PortType::Unknown,
            mode: ChipMode::Unknown,
        },
        header_type,
        class_code,
        bars,
        parent: None,
        reg_node: None,
        config,
        port_number: OnceLock::new(),
        nt_reg_base: 0,
        default_eeprom_width: AtomicU8::new(2),
    }
}

/// Probes the BAR registers, pairing 64-bit BARs across two slots.
fn probe_bars(
    backend: &dyn PciBackend,
    address: PciAddress,
    cfg: &dyn ConfigAccess,
    header_type: u8,
    is_plx_chip: bool,
) -> [PciBar; 6] {
    let mut bars: [PciBar; 6] = Default::default();
    let num_bars = match header_type {
        0 => 6,
        1 => 2,
        _ => {
            debug!("PCI type {} headers have no probeable BARs", header_type);
            return bars;
        }
    };

    let mut upper_64 = false;
    for i in 0..num_bars {
        let value = cfg.read_u32(PCI_REG_BAR_0 + (i as u32) * 4);

        if upper_64 {
            // Upper 32 bits of the previous 64-bit BAR.
            bars[i - 1].properties.bar_value |= u64::from(value) << 32;
            bars[i].properties.flags = BarFlags::UPPER_32 | BarFlags::MEM | BarFlags::PROBED;
            upper_64 = false;
            continue;
        }

        bars[i].properties.flags = BarFlags::PROBED;
        if value == 0 || value == PCI_CFG_RD_ERR_VAL {
            continue;
        }

        bars[i].properties.bar_value = u64::from(value);
        if let Some((physical, size)) = backend.bar_region(address, i) {
            bars[i].properties.physical = physical;
            bars[i].properties.size = size;
        }

        if value & 1 != 0 {
            bars[i].properties.flags |= BarFlags::IO;
        } else {
            bars[i].properties.flags |= BarFlags::MEM;
            match (value >> 1) & 0x3 {
                0 => bars[i].properties.flags |= BarFlags::BITS_32,
                1 => bars[i].properties.flags |= BarFlags::BELOW_1MB,
                2 => bars[i].properties.flags |= BarFlags::BITS_64,
                _ => {}
            }
            if value & (1 << 3) != 0 {
                bars[i].properties.flags |= BarFlags::PREFETCHABLE;
            }
            if bars[i].properties.flags.contains(BarFlags::BITS_64) {
                upper_64 = true;
            }
        }

        // BAR 0 of a PLX chip is a register window; never allow a
        // write-combining mapping even if the hardware bit claims it.
        if i == 0 && is_plx_chip {
            bars[0].properties.flags &= !BarFlags::PREFETCHABLE;
        }
    }

    bars
}

/// Descriptor for contiguous page-locked DMA memory.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct PhysicalMemory {
    pub physical_address: u64,
    pub size: u64,
}

impl DeviceList {
    /// Allocates physically contiguous page-locked memory.
    ///
    /// Not implemented by the service driver variant.
    pub fn physical_memory_allocate(
        &self,
        _id: NodeId,
        _size: u64,
        _smaller_ok: bool,
    ) -> Result<PhysicalMemory> {
        Err(Error::Unsupported)
    }

    /// Frees memory from [`Self::physical_memory_allocate`].
    pub fn physical_memory_free(&self, _id: NodeId, _memory: &PhysicalMemory) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Resolves a physical-memory descriptor for host mapping.
    pub fn physical_memory_map(&self, _id: NodeId, _memory: &PhysicalMemory) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Releases a physical-memory mapping.
    pub fn physical_memory_unmap(&self, _id: NodeId, _memory: &PhysicalMemory) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// Access widths for raw I/O-port transfers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessSize {
    Bit8,
    Bit16,
    Bit32,
}

/// Raw I/O-port transfer.
///
/// Alignment and size are validated before anything is attempted; the
/// transfer itself is not available on the sysfs backend and reports
/// [`Error::Unsupported`].
pub fn io_port_transfer(
    port: u64,
    buffer: &mut [u8],
    access: AccessSize,
    _is_read: bool,
) -> Result<()> {
    match access {
        AccessSize::Bit8 => {}
        AccessSize::Bit16 => {
            if port & 1 != 0 {
                error!("I/O port not aligned on 16-bit boundary");
                return Err(Error::InvalidAddress);
            }
            if buffer.len() & 1 != 0 {
                error!("byte count not aligned on 16-bit boundary");
                return Err(Error::InvalidSize);
            }
        }
        AccessSize::Bit32 => {
            if port & 3 != 0 {
                error!("I/O port not aligned on 32-bit boundary");
                return Err(Error::InvalidAddress);
            }
            if buffer.len() & 3 != 0 {
                error!("byte count not aligned on 32-bit boundary");
                return Err(Error::InvalidSize);
            }
        }
    }
    Err(Error::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::fake_switch;
    use crate::fake::FakeBackend;
    use crate::fake::FakeBarRam;
    use crate::fake::FakeConfig;

    fn addr(bus: u8, dev: u8, func: u8) -> PciAddress {
        PciAddress {
            domain: 0,
            bus,
            dev,
            func,
        }
    }

    #[test]
    fn scan_resolves_identity_and_parents() {
        let (backend, _ram) = fake_switch();
        let list = DeviceList::scan(backend).unwrap();
        assert_eq!(list.len(), 3);

        let up = list.find(&KeyMatch::default(), 0).unwrap();
        let ds = list
            .find(
                &KeyMatch {
                    bus: Some(1),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        let ep = list
            .find(
                &KeyMatch {
                    bus: Some(2),
                    ..Default::default()
                },
                0,
            )
            .unwrap();

        // 0x8612 @ 10B5 resolves to Deneb.
        assert_eq!(list.node(up).key.chip.chip, 0x8612);
        assert_eq!(list.node(up).key.chip.family, ChipFamily::Deneb);

        // Downstream port from the PCIe capability port-type field 0x6.
        let props = list.port_properties(ds).unwrap();
        assert_eq!(props.port_type, PciePortType::Downstream);
        assert_eq!(list.node(ds).key.port_type, PortType::Downstream);

        // Parent edges follow secondary bus numbers.
        assert_eq!(list.node(ds).parent, Some(up));
        assert_eq!(list.node(ep).parent, Some(ds));
    }

    #[test]
    fn register_node_converges_without_cycles() {
        let (backend, _ram) = fake_switch();
        let list = DeviceList::scan(backend).unwrap();
        for (id, _) in list.iter() {
            let first = list.resolve_reg_node(id).unwrap();
            // A second resolution from the fixed point stays put.
            assert_eq!(list.resolve_reg_node(first).unwrap(), first);
        }
    }

    #[test]
    fn bar0_less_port_borrows_upstream_bar0() {
        let (backend, _ram) = fake_switch();
        let list = DeviceList::scan(backend).unwrap();
        let up = list.find(&KeyMatch::default(), 0).unwrap();
        let ds = list
            .find(
                &KeyMatch {
                    bus: Some(1),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        // The downstream port has no BAR 0 of its own in this switch.
        assert_eq!(list.resolve_reg_node(ds).unwrap(), up);
    }

    #[test]
    fn bar_probe_pairs_64_bit_bars() {
        let backend = Arc::new(FakeBackend::new());
        let ram = FakeBarRam::new(0x1000);
        let mut cfg = FakeConfig::new(0x10b5, 0x8612);
        cfg.set_header_type(0);
        // 64-bit prefetchable memory BAR at 0x1_F000_0000.
        cfg.set_bar(0, 0xf000_000c);
        cfg.set_bar(1, 0x1);
        backend.add_function(addr(0, 0, 0), cfg, Some(ram));

        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        let bar0 = list.bar_properties(id, 0).unwrap();
        let bar1 = list.bar_properties(id, 1).unwrap();

        assert!(bar0.flags.contains(BarFlags::MEM | BarFlags::BITS_64));
        assert_eq!(bar0.bar_value, 0x1_f000_000c);
        assert!(bar1.flags.contains(BarFlags::UPPER_32));
        // The upper half is never independently mappable.
        assert!(matches!(
            list.resolve_bar_for_mapping(id, 1),
            Err(Error::InvalidIndex)
        ));
        // BAR 0 of a resolved PLX chip loses its prefetchable bit.
        assert!(!bar0.flags.contains(BarFlags::PREFETCHABLE));
        assert!(!list.resolve_bar_for_mapping(id, 0).unwrap().cacheable);
    }

    #[test]
    fn find_honors_wildcards_and_ordinals() {
        let (backend, _ram) = fake_switch();
        let list = DeviceList::scan(backend).unwrap();

        let all = KeyMatch::default();
        assert_eq!(list.match_count(&all), 3);
        assert!(list.find(&all, 2).is_ok());
        assert!(matches!(list.find(&all, 3), Err(Error::NotFound)));

        let by_vendor = KeyMatch {
            vendor_id: Some(0x10b5),
            ..Default::default()
        };
        assert_eq!(list.match_count(&by_vendor), 3);

        let none = KeyMatch {
            vendor_id: Some(0x8086),
            ..Default::default()
        };
        assert!(matches!(list.find(&none, 0), Err(Error::NotFound)));
    }

    #[test]
    fn set_chip_type_rederives_family_and_revision() {
        let (backend, _ram) = fake_switch();
        let mut list = DeviceList::scan(backend).unwrap();
        let up = list.find(&KeyMatch::default(), 0).unwrap();

        // Upstream port accepts a generic 8000-class override.
        let id = list.set_chip_type(up, 0x8648, None).unwrap();
        assert_eq!(id.chip, 0x8648);
        assert_eq!(id.family, ChipFamily::Deneb);

        // Unsupported model is rejected outright.
        assert!(matches!(
            list.set_chip_type(up, 0x1234, None),
            Err(Error::InvalidData)
        ));

        // Auto-detection restores the probed identity.
        let id = list.set_chip_type(up, 0, None).unwrap();
        assert_eq!(id.chip, 0x8612);

        // Non-upstream ports may not take 8000-class overrides.
        let ep = list
            .find(
                &KeyMatch {
                    bus: Some(2),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        assert!(matches!(
            list.set_chip_type(ep, 0x8612, None),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn disabled_ports_are_filtered_from_the_mask() {
        let (backend, ram) = fake_switch();
        // Deneb reports port enables at 668h; only ports 0-2 are up.
        ram.poke(0x668, 0b111);
        let list = DeviceList::scan(backend).unwrap();
        let up = list.find(&KeyMatch::default(), 0).unwrap();

        let mut mask = 0x00ff_ffff;
        list.filter_disabled_ports(up, &mut mask).unwrap();
        assert_eq!(mask, 0b111);
    }

    #[test]
    fn nt_probe_tells_virtual_from_link_side() {
        use crate::fake::fake_nt_draco;

        let (backend, ram) = fake_nt_draco(false);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        let node = list.node(id);
        assert_eq!(node.key.port_type, PortType::NtVirtual);
        assert_eq!(node.nt_register_base(), 0x3e000);
        // The probe restored the interrupt-line register.
        assert_eq!(ram.read_u32(0x3e03c), 0);

        let (backend, _ram) = fake_nt_draco(true);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        let node = list.node(id);
        assert_eq!(node.key.port_type, PortType::NtLink);
        // Link side register block sits one page above the virtual side.
        assert_eq!(node.nt_register_base(), 0x3f000);
    }

    #[test]
    fn sentinel_endpoints_classify_without_probing() {
        let (backend, _ram) = fake_switch();
        let mut gep = FakeConfig::new(0x10b5, 0x1009);
        gep.set_header_type(0);
        gep.add_pcie_cap(0, 12, 1, 1);
        backend.add_function(addr(2, 1, 0), gep, None);

        let list = DeviceList::scan(backend).unwrap();
        let gep = list
            .find(
                &KeyMatch {
                    device_id: Some(0x1009),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        assert_eq!(list.node(gep).key.port_type, PortType::Gep);
        // A GEP only exists on fabric-mode parts.
        assert_eq!(list.node(gep).key.mode, ChipMode::Fabric);
    }

    #[test]
    fn extra_function_with_dma_class_is_dma_controller() {
        let (backend, _ram) = fake_switch();
        let mut dma = FakeConfig::new(0x10b5, 0x8612);
        dma.set_revision(0xba);
        dma.set_header_type(0);
        dma.set_class(0x088000);
        dma.add_pci_vsec(0x8612, 0xba, 1);
        backend.add_function(addr(0, 0, 1), dma, None);

        let list = DeviceList::scan(backend).unwrap();
        let dma = list
            .find(
                &KeyMatch {
                    function: Some(1),
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        assert_eq!(list.node(dma).key.port_type, PortType::Dma);
    }

    #[test]
    fn io_port_transfer_validates_before_hardware() {
        let mut buf = [0u8; 4];
        assert!(matches!(
            io_port_transfer(0x1001, &mut buf, AccessSize::Bit32, true),
            Err(Error::InvalidAddress)
        ));
        let mut odd = [0u8; 3];
        assert!(matches!(
            io_port_transfer(0x1000, &mut odd, AccessSize::Bit16, true),
            Err(Error::InvalidSize)
        ));
        assert!(matches!(
            io_port_transfer(0x1000, &mut buf, AccessSize::Bit32, true),
            Err(Error::Unsupported)
        ));
    }
}
