// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `plxsvc`: command-line service tool for PLX/Broadcom switch chips.

mod cmdline;

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Serialize;

use plx_api::device::KeyMatch;
use plx_api::perf::PerfCommand as MonitorCommand;
use plx_api::sysfs::SysfsBackend;
use plx_api::DeviceKey;
use plx_api::DeviceList;
use plx_api::NodeId;
use plx_api::PciAddress;
use plx_api::PortProperties;

use crate::cmdline::Args;
use crate::cmdline::Command;
use crate::cmdline::EepromAction;
use crate::cmdline::MultiHostAction;

fn main() -> Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    let list = DeviceList::scan(Arc::new(SysfsBackend::new()))
        .context("failed to scan the PCI bus via sysfs")?;

    match args.command {
        Command::List(cmd) => run_list(&list, cmd),
        Command::Chip(cmd) => run_chip(list, cmd),
        Command::Reg(cmd) => run_reg(&list, cmd),
        Command::Bars(cmd) => run_bars(&list, cmd),
        Command::Eeprom(cmd) => run_eeprom(&list, cmd),
        Command::Perf(cmd) => run_perf(&list, cmd),
        Command::MultiHost(cmd) => run_multi_host(&list, cmd),
    }
}

/// Looks up the device named on the command line.
fn select_device(list: &DeviceList, spec: &str) -> Result<NodeId> {
    let address = PciAddress::from_str(spec)
        .with_context(|| format!("invalid device location '{}'", spec))?;
    let criteria = KeyMatch {
        domain: Some(address.domain),
        bus: Some(address.bus),
        slot: Some(address.dev),
        function: Some(address.func),
        ..Default::default()
    };
    list.find(&criteria, 0)
        .with_context(|| format!("no device at {}", address))
}

#[derive(Serialize)]
struct ListEntry {
    key: DeviceKey,
    port: Option<PortProperties>,
}

fn run_list(list: &DeviceList, cmd: cmdline::ListCommand) -> Result<()> {
    let mut entries = Vec::new();
    for (id, node) in list.iter() {
        if cmd.plx_only && node.key.chip.chip == 0 {
            continue;
        }
        entries.push(ListEntry {
            key: node.key,
            port: list.port_properties(id).ok(),
        });
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        let key = &entry.key;
        let chip = if key.chip.chip != 0 {
            format!(
                "{:04X} rev {:02X} {}",
                key.chip.chip, key.chip.revision, key.chip.family
            )
        } else {
            "-".to_string()
        };
        let port = match &entry.port {
            Some(p) if !p.non_pcie_device => format!(
                "port {:2} x{} gen{}",
                p.port_number, p.link_width, p.link_speed
            ),
            _ => "non-PCIe".to_string(),
        };
        println!(
            "{}  {:04X}:{:04X}  {:<22} {:<12?} {}",
            key.address, key.vendor_id, key.device_id, chip, key.port_type, port
        );
    }
    Ok(())
}

fn run_chip(mut list: DeviceList, cmd: cmdline::ChipCommand) -> Result<()> {
    let id = select_device(&list, &cmd.device)?;

    if let Some(chip) = cmd.set {
        let identity = list
            .set_chip_type(id, chip, cmd.revision)
            .context("chip type override failed")?;
        println!(
            "set chip type: {:04X} rev {:02X} ({})",
            identity.chip, identity.revision, identity.family
        );
        return Ok(());
    }

    let identity = list.chip_type(id);
    println!(
        "chip {:04X} rev {:02X} family {}",
        identity.chip, identity.revision, identity.family
    );
    Ok(())
}

fn run_reg(list: &DeviceList, cmd: cmdline::RegCommand) -> Result<()> {
    let id = select_device(list, &cmd.device)?;
    match cmd.value {
        Some(value) => {
            list.plx_reg_write(id, cmd.offset, value, cmd.port_adjust)
                .context("register write failed")?;
            println!("[{:X}] <= {:08X}", cmd.offset, value);
        }
        None => {
            let value = list
                .plx_reg_read(id, cmd.offset, cmd.port_adjust)
                .context("register read failed")?;
            println!("[{:X}] = {:08X}", cmd.offset, value);
        }
    }
    Ok(())
}

fn run_bars(list: &DeviceList, cmd: cmdline::BarsCommand) -> Result<()> {
    let id = select_device(list, &cmd.device)?;
    for bar in 0..6 {
        let props = match list.bar_properties(id, bar) {
            Ok(props) => props,
            Err(_) => break,
        };
        if props.size == 0 {
            continue;
        }
        println!(
            "BAR {}: value {:010X} phys {:010X} size {:X} [{:?}]",
            bar, props.bar_value, props.physical, props.size, props.flags
        );
    }
    Ok(())
}

fn run_eeprom(list: &DeviceList, cmd: cmdline::EepromCommand) -> Result<()> {
    let id = select_device(list, &cmd.device)?;
    match cmd.action {
        EepromAction::Info(_) => {
            let status = list.eeprom_present(id).context("EEPROM status failed")?;
            println!("status: {:?}", status);
            match list.eeprom_address_width(id) {
                Ok(width) => println!("address width: {}B", width),
                Err(_) => println!("address width: not reported"),
            }
        }
        EepromAction::Save(save) => {
            let mut data = Vec::with_capacity(save.size as usize);
            let mut offset = 0;
            while offset < save.size {
                let word = list
                    .eeprom_read_u32(id, offset)
                    .with_context(|| format!("EEPROM read at {:X} failed", offset))?;
                data.extend_from_slice(&word.to_le_bytes());
                offset += 4;
            }
            fs::write(&save.file, &data)
                .with_context(|| format!("failed to write {}", save.file))?;
            println!("saved {:X} bytes to {}", save.size, save.file);
        }
        EepromAction::Load(load) => {
            let data =
                fs::read(&load.file).with_context(|| format!("failed to read {}", load.file))?;
            if data.len() % 4 != 0 {
                bail!("{} is not a whole number of 32-bit words", load.file);
            }
            for (i, word) in data.chunks_exact(4).enumerate() {
                let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                list.eeprom_write_u32(id, (i * 4) as u32, value)
                    .with_context(|| format!("EEPROM write at {:X} failed", i * 4))?;
            }
            if load.update_crc {
                let crc = list
                    .eeprom_crc_update(id, true)
                    .context("CRC update failed")?;
                println!("programmed {} bytes, CRC {:08X}", data.len(), crc);
            } else {
                println!("programmed {} bytes", data.len());
            }
        }
        EepromAction::Crc(crc) => {
            let (stored, status) = list.eeprom_crc(id).context("CRC read failed")?;
            let calculated = list
                .eeprom_crc_update(id, crc.update)
                .context("CRC calculation failed")?;
            println!("stored: {:08X} [{:?}]", stored, status);
            println!("calculated: {:08X}", calculated);
        }
    }
    Ok(())
}

fn run_perf(list: &DeviceList, cmd: cmdline::PerfCommand) -> Result<()> {
    let id = select_device(list, &cmd.device)?;
    let mut props = [list
        .perf_init_properties(id)
        .context("perf monitor not supported here")?];

    list.perf_monitor_control(id, MonitorCommand::Start)
        .context("failed to start the monitor")?;

    for sample in 0..cmd.samples {
        thread::sleep(Duration::from_millis(cmd.interval_ms));
        list.perf_get_counters(id, &mut props)
            .context("counter readout failed")?;
        let c = &props[0].counters;
        let p = &props[0].prev;
        println!(
            "sample {}: in ph {} pdw {} npdw {} cplh {} cpldw {} dllp {}",
            sample,
            c.ingress_posted_header.wrapping_sub(p.ingress_posted_header),
            c.ingress_posted_dw.wrapping_sub(p.ingress_posted_dw),
            c.ingress_nonposted_dw.wrapping_sub(p.ingress_nonposted_dw),
            c.ingress_cpl_header.wrapping_sub(p.ingress_cpl_header),
            c.ingress_cpl_dw.wrapping_sub(p.ingress_cpl_dw),
            c.ingress_dllp.wrapping_sub(p.ingress_dllp),
        );
        println!(
            "          eg ph {} pdw {} npdw {} cplh {} cpldw {} dllp {}",
            c.egress_posted_header.wrapping_sub(p.egress_posted_header),
            c.egress_posted_dw.wrapping_sub(p.egress_posted_dw),
            c.egress_nonposted_dw.wrapping_sub(p.egress_nonposted_dw),
            c.egress_cpl_header.wrapping_sub(p.egress_cpl_header),
            c.egress_cpl_dw.wrapping_sub(p.egress_cpl_dw),
            c.egress_dllp.wrapping_sub(p.egress_dllp),
        );
    }

    list.perf_monitor_control(id, MonitorCommand::Stop)
        .context("failed to stop the monitor")?;
    Ok(())
}

fn run_multi_host(list: &DeviceList, cmd: cmdline::MultiHostCommand) -> Result<()> {
    let id = select_device(list, &cmd.device)?;
    match cmd.action {
        MultiHostAction::Show(_) => {
            let props = list
                .multi_host_properties(id)
                .context("multi-host properties unavailable")?;
            println!("mode: {:?}", props.mode);
            if !props.is_mgmt_port {
                println!("not the management port; no further detail available");
                return Ok(());
            }
            println!(
                "management port: {} ({})",
                props.mgmt_port_active,
                if props.mgmt_port_active_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("enabled VS mask: {:02X}", props.vs_enabled_mask);
            for vs in 0..plx_api::multi_host::MAX_VIRTUAL_SWITCHES {
                if props.vs_enabled_mask & (1 << vs) == 0 {
                    continue;
                }
                println!(
                    "  VS{}: upstream {:2} downstream {:06X}",
                    vs, props.vs_upstream_port[vs], props.vs_downstream_ports[vs]
                );
            }
        }
        MultiHostAction::Migrate(migrate) => {
            list.multi_host_migrate_ports(
                id,
                migrate.src,
                migrate.dst,
                migrate.mask,
                migrate.reset_src,
            )
            .context("migration failed")?;
            println!(
                "migrated ports {:06X}: VS{} -> VS{}",
                migrate.mask, migrate.src, migrate.dst
            );
        }
    }
    Ok(())
}
