// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware performance counters.
//!
//! Each family lays its counters out differently in the capture RAM; the
//! layout table below drives control sequencing, FIFO readout, and the
//! per-port slicing of the raw dump.

use log::debug;
use log::error;
use serde::Deserialize;
use serde::Serialize;

use crate::chip::ChipFamily;
use crate::device::ChipMode;
use crate::device::DeviceList;
use crate::device::NodeId;
use crate::Error;
use crate::Result;

/// Counter fields tracked per port. NP header counts exist only on Atlas.
pub const PERF_COUNTERS_PER_PORT: usize = 16;

/// Highest port number the monitor can track.
const PERF_MAX_PORTS: u8 = 96;

/// Bogus value Draco-1 sometimes returns instead of a counter.
const DRACO_1_BAD_COUNTER: u32 = 0x4c04_1301;

/// Monitor command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PerfCommand {
    Start,
    Stop,
}

/// One port's counters, one sample deep.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PerfCounters {
    pub ingress_posted_header: u32,
    pub ingress_posted_dw: u32,
    pub ingress_nonposted_header: u32,
    pub ingress_nonposted_dw: u32,
    pub ingress_cpl_header: u32,
    pub ingress_cpl_dw: u32,
    pub ingress_dllp: u32,
    pub ingress_phy: u32,
    pub egress_posted_header: u32,
    pub egress_posted_dw: u32,
    pub egress_nonposted_header: u32,
    pub egress_nonposted_dw: u32,
    pub egress_cpl_header: u32,
    pub egress_cpl_dw: u32,
    pub egress_dllp: u32,
    pub egress_phy: u32,
}

impl PerfCounters {
    fn to_array(self) -> [u32; PERF_COUNTERS_PER_PORT] {
        [
            self.ingress_posted_header,
            self.ingress_posted_dw,
            self.ingress_nonposted_header,
            self.ingress_nonposted_dw,
            self.ingress_cpl_header,
            self.ingress_cpl_dw,
            self.ingress_dllp,
            self.ingress_phy,
            self.egress_posted_header,
            self.egress_posted_dw,
            self.egress_nonposted_header,
            self.egress_nonposted_dw,
            self.egress_cpl_header,
            self.egress_cpl_dw,
            self.egress_dllp,
            self.egress_phy,
        ]
    }

    fn from_array(values: [u32; PERF_COUNTERS_PER_PORT]) -> PerfCounters {
        PerfCounters {
            ingress_posted_header: values[0],
            ingress_posted_dw: values[1],
            ingress_nonposted_header: values[2],
            ingress_nonposted_dw: values[3],
            ingress_cpl_header: values[4],
            ingress_cpl_dw: values[5],
            ingress_dllp: values[6],
            ingress_phy: values[7],
            egress_posted_header: values[8],
            egress_posted_dw: values[9],
            egress_nonposted_header: values[10],
            egress_nonposted_dw: values[11],
            egress_cpl_header: values[12],
            egress_cpl_dw: values[13],
            egress_dllp: values[14],
            egress_phy: values[15],
        }
    }
}

/// Per-port performance-monitor state. `prev` shadows the previous sample
/// for delta/rate calculation and for the Draco-1 glitch correction.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct PerfProperties {
    pub family: ChipFamily,
    pub port_number: u8,
    pub station: u8,
    pub station_port: u8,
    pub link_width: u8,
    pub link_speed: u8,
    pub counters: PerfCounters,
    pub prev: PerfCounters,
}

/// Capture-RAM geometry and control offsets for one family.
struct PerfLayout {
    ctrl: u32,
    ram_ctrl: u32,
    fifo: u32,
    counters_per_port: usize,
    station_count: usize,
    ports_per_station: usize,
    /// Ports per station as laid out in RAM; differs on Capella, whose RAM
    /// keeps a fifth slot per station.
    ram_ports_per_station: usize,
    /// Ingress/egress counters per port (6 on Atlas, which adds NP
    /// headers).
    in_eg_per_port: usize,
    /// Control and FIFO registers are per station rather than global.
    station_based: bool,
    egress_enable_bit: u8,
    egress_all_ports: bool,
}

fn layout_for(list: &DeviceList, id: NodeId) -> Result<PerfLayout> {
    let node = list.node(id);
    let legacy = node.key.mode == ChipMode::LegacyAdapter;
    let layout = match node.key.chip.family {
        ChipFamily::Deneb => PerfLayout {
            ctrl: 0x568,
            ram_ctrl: 0x618,
            fifo: 0x628,
            counters_per_port: 14,
            station_count: 3,
            ports_per_station: 4,
            ram_ports_per_station: 4,
            in_eg_per_port: 5,
            station_based: false,
            egress_enable_bit: 0,
            egress_all_ports: false,
        },
        ChipFamily::Sirius => PerfLayout {
            ctrl: 0x568,
            ram_ctrl: 0x618,
            fifo: 0x628,
            counters_per_port: 13,
            station_count: 1,
            ports_per_station: 16,
            ram_ports_per_station: 16,
            in_eg_per_port: 5,
            station_based: false,
            egress_enable_bit: 0,
            egress_all_ports: false,
        },
        ChipFamily::Cygnus => PerfLayout {
            ctrl: 0x3e0,
            ram_ctrl: 0x3f0,
            fifo: 0x3e4,
            counters_per_port: 14,
            station_count: 6,
            ports_per_station: 4,
            ram_ports_per_station: 4,
            in_eg_per_port: 5,
            station_based: false,
            egress_enable_bit: 7,
            egress_all_ports: false,
        },
        ChipFamily::Mira => PerfLayout {
            // Legacy-adapter mode shifts the PCIe registers up by 1000h.
            ctrl: if legacy { 0x1568 } else { 0x568 },
            ram_ctrl: if legacy { 0x1618 } else { 0x618 },
            fifo: if legacy { 0x1628 } else { 0x628 },
            counters_per_port: 12,
            station_count: 1,
            ports_per_station: 4,
            ram_ports_per_station: 4,
            in_eg_per_port: 5,
            station_based: false,
            egress_enable_bit: 0,
            egress_all_ports: false,
        },
        ChipFamily::Draco1 | ChipFamily::Draco2 => PerfLayout {
            ctrl: 0x3e0,
            ram_ctrl: 0x3f0,
            fifo: 0x3e4,
            counters_per_port: 14,
            station_count: 3,
            // The silicon numbers ports in blocks of 8 but only populates
            // (and stores) 6 per station.
            ports_per_station: 8,
            ram_ports_per_station: 6,
            in_eg_per_port: 5,
            station_based: false,
            egress_enable_bit: 6,
            egress_all_ports: false,
        },
        ChipFamily::Capella1 | ChipFamily::Capella2 => PerfLayout {
            ctrl: 0x3e0,
            ram_ctrl: 0x3f0,
            fifo: 0x3e4,
            counters_per_port: 14,
            station_count: 6,
            ports_per_station: 4,
            ram_ports_per_station: 5,
            in_eg_per_port: 5,
            station_based: true,
            egress_enable_bit: 6,
            egress_all_ports: true,
        },
        ChipFamily::Atlas => PerfLayout {
            ctrl: 0x80_0000 + 0x3e0,
            ram_ctrl: 0x80_0000 + 0x3f0,
            fifo: 0x80_0000 + 0x3e4,
            counters_per_port: 14,
            station_count: 6,
            ports_per_station: 16,
            ram_ports_per_station: 16,
            in_eg_per_port: 6,
            station_based: true,
            egress_enable_bit: 6,
            egress_all_ports: true,
        },
        _ => {
            error!("unsupported chip ({:04X}) for perf monitor", node.key.chip.chip);
            return Err(Error::Unsupported);
        }
    };
    Ok(layout)
}

impl DeviceList {
    /// Prepares the per-port monitor state for a device.
    pub fn perf_init_properties(&self, id: NodeId) -> Result<PerfProperties> {
        let node = self.node(id);
        let layout = layout_for(self, id)?;

        let props = self.port_properties(id)?;
        if props.port_number >= PERF_MAX_PORTS {
            error!("port number exceeds maximum ({})", PERF_MAX_PORTS - 1);
            return Err(Error::Unsupported);
        }

        Ok(PerfProperties {
            family: node.key.chip.family,
            port_number: props.port_number,
            station: props.port_number / layout.ports_per_station as u8,
            station_port: props.port_number % layout.ports_per_station as u8,
            link_width: props.link_width,
            link_speed: props.link_speed,
            counters: PerfCounters::default(),
            prev: PerfCounters::default(),
        })
    }

    /// Starts or stops the monitor.
    pub fn perf_monitor_control(&self, id: NodeId, command: PerfCommand) -> Result<()> {
        let node = self.node(id);
        let family = node.key.chip.family;
        let layout = layout_for(self, id)?;

        let reg_command = match command {
            PerfCommand::Start => {
                debug!("reset & enable monitor with infinite sampling");
                (1 << 31) | (1 << 30) | (1 << 28) | (1 << 27)
            }
            PerfCommand::Stop => {
                debug!("reset & disable monitor");
                1 << 30
            }
        };

        match family {
            ChipFamily::Mira => {
                // Packet-type count filters live in 664h[29:20] of port 0;
                // clear them all so every type is counted.
                let filter = if node.key.mode == ChipMode::LegacyAdapter {
                    0x1664
                } else {
                    0x664
                };
                let reg = self.plx_reg_read(id, filter, false)?;
                self.plx_reg_write(id, filter, reg & !(0x3ff << 20), false)?;
            }
            ChipFamily::Cygnus
            | ChipFamily::Draco1
            | ChipFamily::Draco2
            | ChipFamily::Capella1
            | ChipFamily::Capella2
            | ChipFamily::Atlas => {
                let base = if family == ChipFamily::Atlas { 0x80_0000 } else { 0 };

                // Probe mode corrupts the RAM pointer; disable it while
                // the monitor runs.
                if command == PerfCommand::Start
                    && matches!(
                        family,
                        ChipFamily::Capella1 | ChipFamily::Capella2 | ChipFamily::Atlas
                    )
                {
                    let reg = self.plx_reg_read(id, base + 0x350, false)?;
                    self.plx_reg_write(id, base + 0x350, reg & !(1 << 8), false)?;
                }
                if command == PerfCommand::Start && family != ChipFamily::Cygnus {
                    let reg = self.plx_reg_read(id, base + 0x3f0, false)?;
                    self.plx_reg_write(id, base + 0x3f0, reg | (3 << 8), false)?;
                }

                // Enable/disable the counters port by port.
                let total_ports = layout.station_count * layout.ports_per_station;
                for port in 0..total_ports {
                    let offset = base + (port as u32) * 0x1000;

                    // Ingress enable lives in station port 0 only.
                    if port % layout.ports_per_station == 0 {
                        let reg = self.plx_reg_read(id, offset + 0x768, false)?;
                        let reg = match command {
                            PerfCommand::Start => reg | (1 << 29),
                            PerfCommand::Stop => reg & !(1 << 29),
                        };
                        self.plx_reg_write(id, offset + 0x768, reg, false)?;
                    }

                    if layout.egress_all_ports || port % layout.ports_per_station == 0 {
                        let mut reg = self.plx_reg_read(id, offset + 0xf30, false)?;
                        // Atlas egress credit enable (F30h[21]) reads as 0;
                        // keep it set on every update.
                        if family == ChipFamily::Atlas {
                            reg |= 1 << 21;
                        }
                        let reg = match command {
                            PerfCommand::Start => reg | (1 << layout.egress_enable_bit),
                            PerfCommand::Stop => reg & !(1 << layout.egress_enable_bit),
                        };
                        self.plx_reg_write(id, offset + 0xf30, reg, false)?;
                    }
                }
            }
            _ => {}
        }

        // Kick the monitor, per station where control is station-based.
        for station in 0..layout.station_count {
            if station == 0 || layout.station_based {
                let offset =
                    layout.ctrl + (station * layout.ports_per_station * 0x1000) as u32;
                self.plx_reg_write(id, offset, reg_command, false)?;
            }
        }

        Ok(())
    }

    /// Resets the hardware counters.
    pub fn perf_reset_counters(&self, id: NodeId) -> Result<()> {
        let layout = layout_for(self, id)?;

        // Reset (30) & enable monitor (31) & infinite sampling (28) &
        // start (27).
        let command = (1u32 << 31) | (1 << 30) | (1 << 28) | (1 << 27);
        for station in 0..layout.station_count {
            if station == 0 || layout.station_based {
                let offset =
                    layout.ctrl + (station * layout.ports_per_station * 0x1000) as u32;
                self.plx_reg_write(id, offset, command, false)?;
            }
        }
        Ok(())
    }

    /// Snapshots the counters for each supplied port.
    pub fn perf_get_counters(&self, id: NodeId, props: &mut [PerfProperties]) -> Result<()> {
        let node = self.node(id);
        let family = node.key.chip.family;
        let layout = layout_for(self, id)?;

        // Capture type 2, reset read pointer, enable RAM.
        let ram_command = (2u32 << 4) | (1 << 2) | (1 << 0);
        for station in 0..layout.station_count {
            if station == 0 || layout.station_based {
                let offset =
                    layout.ram_ctrl + (station * layout.ports_per_station * 0x1000) as u32;
                self.plx_reg_write(id, offset, ram_command, false)?;
            }
        }

        // Drain the FIFO into one station-major dump.
        let words_per_station = layout.counters_per_port * layout.ram_ports_per_station;
        let total = layout.station_count * words_per_station;
        let mut counters = vec![0u32; total];
        let mut fifo = layout.fifo;
        for (i, slot) in counters.iter_mut().enumerate() {
            if i > 0 && i % words_per_station == 0 && layout.station_based {
                // Station-based chips keep one FIFO per station.
                fifo += (layout.ports_per_station * 0x1000) as u32;
            }
            *slot = self.plx_reg_read(id, fifo, false)?;
        }

        for prop in props.iter_mut() {
            let station = prop.station as usize;
            let station_port = prop.station_port as usize;
            if station >= layout.station_count || station_port >= layout.ram_ports_per_station {
                error!(
                    "station {} port {} outside capture RAM; skipping",
                    station, station_port
                );
                continue;
            }

            let prev_tmp = prop.prev.to_array();
            prop.prev = prop.counters;

            let mut current = prop.counters.to_array();
            let base = station * words_per_station;

            // Ingress block.
            let mut index = base + station_port * layout.in_eg_per_port;
            current[0] = counters[index]; // posted header
            index += 1;
            current[1] = counters[index]; // posted DW
            index += 1;
            if layout.in_eg_per_port == 6 {
                current[2] = counters[index]; // NP header (Atlas)
                index += 1;
            }
            current[3] = counters[index]; // NP DW
            index += 1;
            current[4] = counters[index]; // CPL header
            index += 1;
            current[5] = counters[index]; // CPL DW

            // Egress block follows all ingress blocks.
            let mut index = base
                + layout.in_eg_per_port * layout.ram_ports_per_station
                + station_port * layout.in_eg_per_port;
            current[8] = counters[index];
            index += 1;
            current[9] = counters[index];
            index += 1;
            if layout.in_eg_per_port == 6 {
                current[10] = counters[index];
                index += 1;
            }
            current[11] = counters[index];
            index += 1;
            current[12] = counters[index];
            index += 1;
            current[13] = counters[index];

            // DLLP ingress block follows all egress blocks.
            let mut index = base + 2 * layout.in_eg_per_port * layout.ram_ports_per_station;
            if family == ChipFamily::Sirius {
                // Even ports first, odd ports after them.
                index += station_port / 2;
                if station_port & 1 != 0 {
                    index += layout.ram_ports_per_station;
                }
            } else {
                index += station_port;
            }
            current[6] = counters[index];

            // DLLP egress follows DLLP ingress.
            if family == ChipFamily::Sirius {
                index += layout.ram_ports_per_station / 2;
            } else {
                index += layout.ram_ports_per_station;
            }
            // Capella's egress-DLLP block skips one slot; port 4's value
            // is physically absent from RAM.
            if matches!(family, ChipFamily::Capella1 | ChipFamily::Capella2) {
                index += 1;
            }
            current[14] = counters[index];

            // PHY counters always read 0.
            current[7] = 0;
            current[15] = 0;

            // Draco-1 can report a counter as 0 (or a fixed garbage word)
            // on an active port; substitute a value extrapolated from the
            // previous two samples, handling 32-bit wrap.
            if family == ChipFamily::Draco1 && prop.link_width != 0 {
                let prev = prop.prev.to_array();
                for (i, value) in current.iter_mut().enumerate() {
                    if (*value == 0 && prev[i] != 0) || *value == DRACO_1_BAD_COUNTER {
                        let mut last = i64::from(prev[i]);
                        if prev[i] < prev_tmp[i] {
                            last += 1i64 << 32;
                        }
                        *value = prev[i].wrapping_add((last - i64::from(prev_tmp[i])) as u32);
                    }
                }
            }

            prop.counters = PerfCounters::from_array(current);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyMatch;
    use crate::fake::fake_perf;

    fn prop(family: ChipFamily, station: u8, station_port: u8) -> PerfProperties {
        PerfProperties {
            family,
            station,
            station_port,
            ..Default::default()
        }
    }

    #[test]
    fn deneb_slicing_matches_documented_layout() {
        // 14 counters * 4 RAM ports * 3 stations = 168 words.
        let (backend, _ram) = fake_perf(0x8612, 0xba, (0..168).collect());
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let mut props = [prop(ChipFamily::Deneb, 1, 2)];
        list.perf_get_counters(id, &mut props).unwrap();
        let c = props[0].counters;

        // Station 1, port 2: ingress block starts at word 56 + 2*5 = 66.
        assert_eq!(c.ingress_posted_header, 66);
        assert_eq!(c.ingress_cpl_dw, 70);
        // Egress block starts at word 56 + 20 + 10 = 86.
        assert_eq!(c.egress_posted_header, 86);
        assert_eq!(c.egress_cpl_dw, 90);
        // DLLP blocks: 56 + 40 + 2 and four slots later.
        assert_eq!(c.ingress_dllp, 98);
        assert_eq!(c.egress_dllp, 102);
        // PHY counters are meaningless and forced to zero.
        assert_eq!(c.ingress_phy, 0);
        assert_eq!(c.egress_phy, 0);
    }

    #[test]
    fn sirius_interleaves_odd_and_even_dllp() {
        // 13 counters * 16 ports = 208 words.
        let (backend, _ram) = fake_perf(0x8618, 0xba, (0..208).collect());
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let mut props = [prop(ChipFamily::Sirius, 0, 3)];
        list.perf_get_counters(id, &mut props).unwrap();
        let c = props[0].counters;
        // Odd port 3: ingress DLLP at 160 + 1 + 16, egress 8 later.
        assert_eq!(c.ingress_dllp, 177);
        assert_eq!(c.egress_dllp, 185);
    }

    #[test]
    fn draco1_bogus_counters_are_extrapolated() {
        // Draco-1: 14 counters * 6 RAM ports * 3 stations = 252 words.
        let (backend, ram) = fake_perf(0x8748, 0xaa, vec![0; 252]);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        assert_eq!(
            list.node(id).key.chip.family,
            ChipFamily::Draco1
        );

        let mut props = [PerfProperties {
            family: ChipFamily::Draco1,
            station: 0,
            station_port: 0,
            link_width: 4,
            ..Default::default()
        }];

        // Two good samples: 100 then 150.
        let mut data = vec![0u32; 252];
        data[0] = 100;
        ram.set_perf_data(data.clone());
        list.perf_get_counters(id, &mut props).unwrap();
        data[0] = 150;
        ram.set_perf_data(data.clone());
        list.perf_get_counters(id, &mut props).unwrap();
        assert_eq!(props[0].counters.ingress_posted_header, 150);

        // Bogus zero readout: substitute previous + last delta (50).
        data[0] = 0;
        ram.set_perf_data(data.clone());
        list.perf_get_counters(id, &mut props).unwrap();
        assert_eq!(props[0].counters.ingress_posted_header, 200);

        // The fixed garbage word triggers the same correction.
        let mut props = [PerfProperties {
            family: ChipFamily::Draco1,
            station: 0,
            station_port: 0,
            link_width: 4,
            ..Default::default()
        }];
        data[0] = 100;
        ram.set_perf_data(data.clone());
        list.perf_get_counters(id, &mut props).unwrap();
        data[0] = 160;
        ram.set_perf_data(data.clone());
        list.perf_get_counters(id, &mut props).unwrap();
        data[0] = DRACO_1_BAD_COUNTER;
        ram.set_perf_data(data);
        list.perf_get_counters(id, &mut props).unwrap();
        assert_eq!(props[0].counters.ingress_posted_header, 220);
    }

    #[test]
    fn out_of_range_station_is_skipped() {
        let (backend, _ram) = fake_perf(0x8612, 0xba, (0..168).collect());
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        let mut props = [prop(ChipFamily::Deneb, 7, 0)];
        list.perf_get_counters(id, &mut props).unwrap();
        assert_eq!(props[0].counters, PerfCounters::default());
    }

    #[test]
    fn monitor_control_writes_command_register() {
        let (backend, ram) = fake_perf(0x8612, 0xba, (0..168).collect());
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();

        list.perf_monitor_control(id, PerfCommand::Start).unwrap();
        assert_eq!(
            ram.peek(0x568),
            (1 << 31) | (1 << 30) | (1 << 28) | (1 << 27)
        );
        list.perf_monitor_control(id, PerfCommand::Stop).unwrap();
        assert_eq!(ram.peek(0x568), 1 << 30);

        list.perf_reset_counters(id).unwrap();
        assert_eq!(
            ram.peek(0x568),
            (1 << 31) | (1 << 30) | (1 << 28) | (1 << 27)
        );
    }

    #[test]
    fn unsupported_family_is_refused() {
        let (backend, _ram) = fake_perf(0x8505, 0xaa, vec![]);
        let list = DeviceList::scan(backend).unwrap();
        let id = list.find(&KeyMatch::default(), 0).unwrap();
        assert!(matches!(
            list.perf_init_properties(id),
            Err(Error::Unsupported)
        ));
    }
}
