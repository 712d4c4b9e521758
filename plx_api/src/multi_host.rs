// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-host virtual-switch management.
//!
//! Fabric-capable chips partition their downstream ports into up to eight
//! virtual switches, each with its own upstream port. Reading the topology
//! and migrating ports between partitions is only possible from the active
//! management port.

use std::thread;
use std::time::Duration;

use log::debug;
use log::error;
use serde::Deserialize;
use serde::Serialize;

use crate::device::DeviceList;
use crate::device::NodeId;
use crate::Error;
use crate::Result;

/// Management-port configuration register.
const REG_MGMT_PORT_CONFIG: u32 = 0x354;
/// Enabled-virtual-switch bitmask register.
const REG_VS_ENABLE: u32 = 0x358;
/// Per-VS upstream port number registers (one per VS).
const REG_VS_UPSTREAM: u32 = 0x360;
/// Per-VS downstream port ownership vectors (one per VS).
const REG_VS_DOWNSTREAM: u32 = 0x380;
/// Per-VS reset control.
const REG_VS_RESET: u32 = 0x3a0;

/// Maximum virtual switches per chip.
pub const MAX_VIRTUAL_SWITCHES: usize = 8;

/// Hold time for a virtual-switch reset pulse.
const VS_RESET_HOLD: Duration = Duration::from_millis(10);

/// Overall switch operating mode.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum SwitchMode {
    #[default]
    Standard,
    VirtualSwitch,
}

/// Virtual-switch topology as read from the management port.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct MultiHostProperties {
    pub mode: SwitchMode,
    /// Whether this device is the active management port; the per-VS
    /// details below are only populated when it is.
    pub is_mgmt_port: bool,
    pub mgmt_port_active: u8,
    pub mgmt_port_active_enabled: bool,
    pub mgmt_port_redundant: u8,
    pub mgmt_port_redundant_enabled: bool,
    /// Bit per enabled virtual switch.
    pub vs_enabled_mask: u16,
    pub vs_upstream_port: [u8; MAX_VIRTUAL_SWITCHES],
    /// 24-bit downstream ownership vector per VS, upstream port excluded.
    pub vs_downstream_ports: [u32; MAX_VIRTUAL_SWITCHES],
}

impl DeviceList {
    /// Reads the virtual-switch topology.
    pub fn multi_host_properties(&self, id: NodeId) -> Result<MultiHostProperties> {
        let node = self.node(id);
        let mut properties = MultiHostProperties::default();

        if !node.key.chip.descriptor().supports_multi_host {
            error!(
                "device ({:04X}) does not support multi-host",
                node.key.chip.chip
            );
            return Err(Error::Unsupported);
        }

        // Topology registers only decode through the management port.
        let mgmt = self.plx_reg_read(id, REG_MGMT_PORT_CONFIG, false)?;
        if mgmt == 0 {
            properties.mode = SwitchMode::VirtualSwitch;
            debug!("device is in multi-host mode, but not the management port");
            return Ok(properties);
        }

        properties.is_mgmt_port = true;
        properties.mgmt_port_active = (mgmt & 0x1f) as u8;
        properties.mgmt_port_active_enabled = mgmt & (1 << 5) != 0;
        properties.mgmt_port_redundant = ((mgmt >> 8) & 0x1f) as u8;
        properties.mgmt_port_redundant_enabled = mgmt & (1 << 13) != 0;

        let vs_enable = self.plx_reg_read(id, REG_VS_ENABLE, false)?;
        properties.vs_enabled_mask = vs_enable as u16;

        let mut total_vs = 0;
        for vs in 0..MAX_VIRTUAL_SWITCHES {
            if vs_enable & (1 << vs) == 0 {
                continue;
            }
            total_vs += 1;

            let upstream = self.plx_reg_read(id, REG_VS_UPSTREAM + (vs as u32) * 4, false)?;
            properties.vs_upstream_port[vs] = (upstream & 0x1f) as u8;

            let downstream = self.plx_reg_read(id, REG_VS_DOWNSTREAM + (vs as u32) * 4, false)?;
            properties.vs_downstream_ports[vs] = downstream & 0x00ff_ffff;
            // The upstream port's own bit is not a downstream port.
            properties.vs_downstream_ports[vs] &= !(1 << properties.vs_upstream_port[vs]);
        }

        // A single enabled VS is just a standard fan-out switch.
        if total_vs > 1 {
            properties.mode = SwitchMode::VirtualSwitch;
        }

        Ok(properties)
    }

    /// Migrates downstream ports from one virtual switch to another.
    ///
    /// `reset_source` pulses the source VS through reset afterward so its
    /// attached devices re-train.
    pub fn multi_host_migrate_ports(
        &self,
        id: NodeId,
        vs_source: u16,
        vs_dest: u16,
        port_mask: u32,
        reset_source: bool,
    ) -> Result<()> {
        let mut properties = self.multi_host_properties(id)?;

        // Only the management port of a multi-host switch may migrate.
        if properties.mode != SwitchMode::VirtualSwitch || !properties.is_mgmt_port {
            return Err(Error::Unsupported);
        }

        debug!(
            "migrate DS ports ({:08X}) from VS{} to VS{}{}",
            port_mask,
            vs_source,
            vs_dest,
            if reset_source { " & reset source" } else { "" }
        );

        if vs_source as usize >= MAX_VIRTUAL_SWITCHES || vs_dest as usize >= MAX_VIRTUAL_SWITCHES {
            error!("source or destination VS is not valid");
            return Err(Error::InvalidIndex);
        }
        let src = vs_source as usize;
        let dst = vs_dest as usize;

        if properties.vs_enabled_mask & (1 << src) == 0 {
            error!("source VS ({}) not enabled", vs_source);
            return Err(Error::InvalidAccess);
        }

        // Every migrating port must currently belong to the source.
        if properties.vs_downstream_ports[src] & port_mask != port_mask {
            error!("one or more DS ports not owned by the source VS");
            return Err(Error::InvalidData);
        }

        properties.vs_downstream_ports[src] &= !port_mask;
        properties.vs_downstream_ports[dst] |= port_mask;

        self.plx_reg_write(
            id,
            REG_VS_DOWNSTREAM + (src as u32) * 4,
            properties.vs_downstream_ports[src],
            false,
        )?;
        self.plx_reg_write(
            id,
            REG_VS_DOWNSTREAM + (dst as u32) * 4,
            properties.vs_downstream_ports[dst],
            false,
        )?;

        if properties.vs_enabled_mask & (1 << dst) == 0 {
            debug!("enabling destination VS{}", vs_dest);
            self.plx_reg_write(
                id,
                REG_VS_ENABLE,
                u32::from(properties.vs_enabled_mask) | (1 << dst),
                false,
            )?;
        }

        if reset_source {
            let reset = self.plx_reg_read(id, REG_VS_RESET, false)?;
            self.plx_reg_write(id, REG_VS_RESET, reset | (1 << src), false)?;
            thread::sleep(VS_RESET_HOLD);
            self.plx_reg_write(id, REG_VS_RESET, reset & !(1u32 << src), false)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_multi_host;

    fn vs_masks(list: &DeviceList, id: NodeId) -> (u32, u32) {
        let props = list.multi_host_properties(id).unwrap();
        (props.vs_downstream_ports[0], props.vs_downstream_ports[2])
    }

    #[test]
    fn properties_decode_management_registers() {
        // VS0 owns ports {1,2,3} with upstream 0; VS2 owns {8,9}.
        let (backend, _ram) = fake_multi_host();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let props = list.multi_host_properties(id).unwrap();
        assert!(props.is_mgmt_port);
        assert_eq!(props.mode, SwitchMode::VirtualSwitch);
        assert_eq!(props.vs_enabled_mask, 0b101);
        assert_eq!(props.vs_upstream_port[0], 0);
        // The upstream port's bit is masked out of its downstream set.
        assert_eq!(props.vs_downstream_ports[0], 0b1110);
        assert_eq!(props.vs_downstream_ports[2], 0x300);
    }

    #[test]
    fn migration_preserves_port_ownership() {
        let (backend, _ram) = fake_multi_host();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let (old_src, old_dst) = vs_masks(&list, id);
        list.multi_host_migrate_ports(id, 0, 2, 0b0110, false)
            .unwrap();
        let (new_src, new_dst) = vs_masks(&list, id);

        assert_eq!(new_src & 0b0110, 0);
        assert_eq!(new_dst & 0b0110, 0b0110);
        // No ports lost or duplicated.
        assert_eq!(new_src | new_dst, old_src | old_dst);
        assert_eq!(new_src & new_dst, 0);
    }

    #[test]
    fn migration_rejects_unowned_ports() {
        let (backend, _ram) = fake_multi_host();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let before = vs_masks(&list, id);
        // Port 9 belongs to VS2, not VS0.
        assert!(matches!(
            list.multi_host_migrate_ports(id, 0, 2, 0x200, false),
            Err(Error::InvalidData)
        ));
        assert_eq!(vs_masks(&list, id), before);

        assert!(matches!(
            list.multi_host_migrate_ports(id, 8, 0, 1, false),
            Err(Error::InvalidIndex)
        ));
        // VS1 is disabled.
        assert!(matches!(
            list.multi_host_migrate_ports(id, 1, 0, 0, false),
            Err(Error::InvalidAccess)
        ));
    }

    #[test]
    fn migration_enables_destination_and_can_reset_source() {
        let (backend, ram) = fake_multi_host();
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        // VS3 starts disabled; migration brings it up.
        list.multi_host_migrate_ports(id, 0, 3, 0b1000, true).unwrap();
        let props = list.multi_host_properties(id).unwrap();
        assert_ne!(props.vs_enabled_mask & (1 << 3), 0);
        assert_eq!(props.vs_downstream_ports[3] & 0b1000, 0b1000);
        // The reset pulse ended deasserted.
        assert_eq!(ram.peek(0x3a0) & 1, 0);
    }

    #[test]
    fn non_management_port_sees_mode_only() {
        let (backend, ram) = fake_multi_host();
        // Zero management-port config: not the management port.
        ram.poke(0x354, 0);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let props = list.multi_host_properties(id).unwrap();
        assert!(!props.is_mgmt_port);
        assert_eq!(props.mode, SwitchMode::VirtualSwitch);
        assert!(matches!(
            list.multi_host_migrate_ports(id, 0, 2, 1, false),
            Err(Error::Unsupported)
        ));
    }
}
