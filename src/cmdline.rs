// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command-line definitions for the `plxsvc` tool.

use argh::FromArgs;

#[derive(FromArgs)]
/// Service tool for PLX/Broadcom PCI switch chips.
pub struct Args {
    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum Command {
    List(ListCommand),
    Chip(ChipCommand),
    Reg(RegCommand),
    Bars(BarsCommand),
    Eeprom(EepromCommand),
    Perf(PerfCommand),
    MultiHost(MultiHostCommand),
}

#[derive(FromArgs)]
/// List discovered PCI functions and their resolved PLX identity.
#[argh(subcommand, name = "list")]
pub struct ListCommand {
    /// restrict to PLX/Broadcom devices
    #[argh(switch)]
    pub plx_only: bool,
    /// emit machine-readable JSON
    #[argh(switch)]
    pub json: bool,
}

#[derive(FromArgs)]
/// Show or override a device's chip type.
#[argh(subcommand, name = "chip")]
pub struct ChipCommand {
    /// device location as [dddd:]bb:dd.f
    #[argh(option)]
    pub device: String,
    /// new chip type (hex), 0 to re-run auto-detection
    #[argh(option, from_str_fn(parse_hex_u16))]
    pub set: Option<u16>,
    /// revision override used together with --set (hex)
    #[argh(option, from_str_fn(parse_hex_u8))]
    pub revision: Option<u8>,
}

#[derive(FromArgs)]
/// Read or write a PLX internal register.
#[argh(subcommand, name = "reg")]
pub struct RegCommand {
    /// device location as [dddd:]bb:dd.f
    #[argh(option)]
    pub device: String,
    /// register offset (hex)
    #[argh(option, from_str_fn(parse_hex_u32))]
    pub offset: u32,
    /// value to write (hex); omit to read
    #[argh(option, from_str_fn(parse_hex_u32))]
    pub value: Option<u32>,
    /// adjust the offset for the device's port
    #[argh(switch)]
    pub port_adjust: bool,
}

#[derive(FromArgs)]
/// Show the device's BAR properties.
#[argh(subcommand, name = "bars")]
pub struct BarsCommand {
    /// device location as [dddd:]bb:dd.f
    #[argh(option)]
    pub device: String,
}

#[derive(FromArgs)]
/// EEPROM status, transfer, and CRC operations.
#[argh(subcommand, name = "eeprom")]
pub struct EepromCommand {
    /// device location as [dddd:]bb:dd.f
    #[argh(option)]
    pub device: String,
    #[argh(subcommand)]
    pub action: EepromAction,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum EepromAction {
    Info(EepromInfoCommand),
    Save(EepromSaveCommand),
    Load(EepromLoadCommand),
    Crc(EepromCrcCommand),
}

#[derive(FromArgs)]
/// Report EEPROM presence and address width.
#[argh(subcommand, name = "info")]
pub struct EepromInfoCommand {}

#[derive(FromArgs)]
/// Dump EEPROM contents to a file of raw little-endian words.
#[argh(subcommand, name = "save")]
pub struct EepromSaveCommand {
    /// output file
    #[argh(option)]
    pub file: String,
    /// number of bytes to dump (hex, default 400h)
    #[argh(option, from_str_fn(parse_hex_u32), default = "0x400")]
    pub size: u32,
}

#[derive(FromArgs)]
/// Program EEPROM contents from a file of raw little-endian words.
#[argh(subcommand, name = "load")]
pub struct EepromLoadCommand {
    /// input file
    #[argh(option)]
    pub file: String,
    /// recompute and store the CRC after programming
    #[argh(switch)]
    pub update_crc: bool,
}

#[derive(FromArgs)]
/// Show the stored and calculated EEPROM CRC.
#[argh(subcommand, name = "crc")]
pub struct EepromCrcCommand {
    /// write the calculated CRC back to the EEPROM
    #[argh(switch)]
    pub update: bool,
}

#[derive(FromArgs)]
/// Sample the hardware performance counters.
#[argh(subcommand, name = "perf")]
pub struct PerfCommand {
    /// device location as [dddd:]bb:dd.f
    #[argh(option)]
    pub device: String,
    /// number of samples to take
    #[argh(option, default = "2")]
    pub samples: u32,
    /// milliseconds between samples
    #[argh(option, default = "1000")]
    pub interval_ms: u64,
}

#[derive(FromArgs)]
/// Multi-host virtual-switch topology and port migration.
#[argh(subcommand, name = "multi-host")]
pub struct MultiHostCommand {
    /// device location of the management port as [dddd:]bb:dd.f
    #[argh(option)]
    pub device: String,
    #[argh(subcommand)]
    pub action: MultiHostAction,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum MultiHostAction {
    Show(MultiHostShowCommand),
    Migrate(MultiHostMigrateCommand),
}

#[derive(FromArgs)]
/// Show the virtual-switch topology.
#[argh(subcommand, name = "show")]
pub struct MultiHostShowCommand {}

#[derive(FromArgs)]
/// Migrate downstream ports between virtual switches.
#[argh(subcommand, name = "migrate")]
pub struct MultiHostMigrateCommand {
    /// source virtual switch (0-7)
    #[argh(option)]
    pub src: u16,
    /// destination virtual switch (0-7)
    #[argh(option)]
    pub dst: u16,
    /// downstream port mask to move (hex)
    #[argh(option, from_str_fn(parse_hex_u32))]
    pub mask: u32,
    /// pulse the source VS through reset afterward
    #[argh(switch)]
    pub reset_src: bool,
}

fn strip_hex(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

pub fn parse_hex_u8(value: &str) -> Result<u8, String> {
    u8::from_str_radix(strip_hex(value), 16).map_err(|e| e.to_string())
}

pub fn parse_hex_u16(value: &str) -> Result<u16, String> {
    u16::from_str_radix(strip_hex(value), 16).map_err(|e| e.to_string())
}

pub fn parse_hex_u32(value: &str) -> Result<u32, String> {
    u32::from_str_radix(strip_hex(value), 16).map_err(|e| e.to_string())
}
