//! Tape port device slots.
//!
//! Two ports, each with at most one active device. Devices register once
//! under a fixed id and are switched per port through the
//! `TapePort1Device`/`TapePort2Device` resources. Lines from the machine
//! (motor, write, sense out) go to the port's device; lines from devices
//! (sense, read/flux) are collected in [`TapeLines`] for the machine to
//! forward to the 6510 port and CIA1 FLAG.

mod devices;

use std::collections::BTreeMap;

use emu_core::{AlarmContext, Snapshot, SnapshotError, SnapshotVersion};

use crate::config::C64Model;
use crate::error::TapeportError;

pub use devices::{
    SenseDongle, TAPE_LOG_CAPACITY, TapeDiagHarness, TapeLog, TapeLogEntry, TapeLogLine,
};

pub const TAPEPORT_MAX_PORTS: usize = 2;

pub const TAPEPORT_DEVICE_NONE: u32 = 0;
pub const TAPEPORT_DEVICE_DATASETTE: u32 = 1;
pub const TAPEPORT_DEVICE_SENSE_DONGLE: u32 = 4;
pub const TAPEPORT_DEVICE_TAPE_DIAG_586220_HARNESS: u32 = 5;
pub const TAPEPORT_DEVICE_TAPE_LOG: u32 = 7;
pub const TAPEPORT_MAX_DEVICE_ID: u32 = 15;

pub const MACHINE_C64: u8 = 0x01;
pub const MACHINE_C128: u8 = 0x02;
pub const MACHINE_ALL: u8 = MACHINE_C64 | MACHINE_C128;

pub const PORT_1: u8 = 0x01;
pub const PORT_2: u8 = 0x02;
pub const PORT_ALL: u8 = PORT_1 | PORT_2;

const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(0, 0);

#[must_use]
pub const fn machine_mask(model: C64Model) -> u8 {
    match model {
        C64Model::C64 => MACHINE_C64,
        C64Model::C128 => MACHINE_C128,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TapeportDeviceType {
    Tape,
    Storage,
    Rtc,
    Dongle,
    Harness,
}

/// Static description of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeportDeviceInfo {
    pub name: &'static str,
    pub device_type: TapeportDeviceType,
    pub machine_mask: u8,
    pub port_mask: u8,
}

/// Registry entry as listed for a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeportDeviceEntry {
    pub id: u32,
    pub info: TapeportDeviceInfo,
}

/// Lines driven by tape port devices toward the machine.
#[derive(Debug, Default)]
pub struct TapeLines {
    sense: [bool; TAPEPORT_MAX_PORTS],
    flux: [u32; TAPEPORT_MAX_PORTS],
    flux_total: [u64; TAPEPORT_MAX_PORTS],
    read_level: [bool; TAPEPORT_MAX_PORTS],
}

impl TapeLines {
    /// `pressed` pulls the sense line low.
    pub fn set_tape_sense(&mut self, port: usize, pressed: bool) {
        if let Some(s) = self.sense.get_mut(port) {
            *s = pressed;
        }
    }

    /// A flux change on the read line. `level` is the half-wave phase on
    /// C16-style tapes.
    pub fn trigger_flux_change(&mut self, port: usize, level: bool) {
        if port < TAPEPORT_MAX_PORTS {
            self.flux[port] += 1;
            self.flux_total[port] += 1;
            self.read_level[port] = level;
        }
    }

    #[must_use]
    pub fn sense(&self, port: usize) -> bool {
        self.sense.get(port).copied().unwrap_or(false)
    }

    /// Sense as the machine sees it: any port holding it low.
    #[must_use]
    pub fn any_sense(&self) -> bool {
        self.sense.iter().any(|&s| s)
    }

    /// Flux changes since the last call.
    pub fn take_flux_changes(&mut self, port: usize) -> u32 {
        self.flux.get_mut(port).map_or(0, std::mem::take)
    }

    #[must_use]
    pub fn flux_total(&self, port: usize) -> u64 {
        self.flux_total.get(port).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn read_level(&self, port: usize) -> bool {
        self.read_level.get(port).copied().unwrap_or(false)
    }
}

/// What a device may touch while handling a line change.
pub struct TapeContext<'a> {
    pub alarms: &'a mut AlarmContext,
    pub lines: &'a mut TapeLines,
}

/// A device that plugs into a tape port.
pub trait TapeportDevice {
    fn info(&self) -> TapeportDeviceInfo;

    /// Called when the device is selected (`true`) or deselected (`false`)
    /// on `port`.
    fn enable(
        &mut self,
        port: usize,
        on: bool,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), TapeportError>;

    fn reset(&mut self, _port: usize, _ctx: &mut TapeContext<'_>) {}

    fn set_motor(&mut self, _port: usize, _on: bool, _ctx: &mut TapeContext<'_>) {}

    fn toggle_write_bit(&mut self, _port: usize, _bit: bool, _ctx: &mut TapeContext<'_>) {}

    fn set_sense_out(&mut self, _port: usize, _sense: bool, _ctx: &mut TapeContext<'_>) {}

    fn write_snapshot(
        &self,
        _port: usize,
        _snap: &mut Snapshot,
        _alarms: &AlarmContext,
    ) -> Result<(), SnapshotError> {
        Ok(())
    }

    fn read_snapshot(
        &mut self,
        _port: usize,
        _snap: &Snapshot,
        _ctx: &mut TapeContext<'_>,
    ) -> Result<(), SnapshotError> {
        Ok(())
    }
}

/// Device registry and per-port selection.
pub struct Tapeport {
    devices: BTreeMap<u32, Box<dyn TapeportDevice>>,
    active: [u32; TAPEPORT_MAX_PORTS],
    machine: u8,
}

impl Tapeport {
    #[must_use]
    pub fn new(model: C64Model) -> Self {
        Self {
            devices: BTreeMap::new(),
            active: [TAPEPORT_DEVICE_NONE; TAPEPORT_MAX_PORTS],
            machine: machine_mask(model),
        }
    }

    pub fn register(
        &mut self,
        id: u32,
        device: Box<dyn TapeportDevice>,
    ) -> Result<(), TapeportError> {
        if id == TAPEPORT_DEVICE_NONE || id > TAPEPORT_MAX_DEVICE_ID {
            return Err(TapeportError::InvalidId(id));
        }
        if self.devices.contains_key(&id) {
            return Err(TapeportError::Duplicate(id));
        }
        log::debug!("tapeport device {id} registered: {}", device.info().name);
        self.devices.insert(id, device);
        Ok(())
    }

    /// Id of the device on `port`, 0 for none.
    #[must_use]
    pub fn device_id(&self, port: usize) -> u32 {
        self.active.get(port).copied().unwrap_or(TAPEPORT_DEVICE_NONE)
    }

    #[must_use]
    pub fn device_info(&self, id: u32) -> Option<TapeportDeviceInfo> {
        self.devices.get(&id).map(|d| d.info())
    }

    fn compatible(&self, info: &TapeportDeviceInfo, port: usize) -> bool {
        info.machine_mask & self.machine != 0 && info.port_mask & (1 << port) != 0
    }

    /// Select device `id` on `port`. The old device is disabled before the
    /// new one is enabled; if enabling fails the port is left empty.
    pub fn set_device(
        &mut self,
        port: usize,
        id: u32,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), TapeportError> {
        if port >= TAPEPORT_MAX_PORTS {
            return Err(TapeportError::InvalidPort(port));
        }
        if self.active[port] == id {
            return Ok(());
        }
        if id != TAPEPORT_DEVICE_NONE {
            let info = self
                .device_info(id)
                .ok_or(TapeportError::UnknownDevice(id))?;
            if !self.compatible(&info, port) {
                return Err(TapeportError::Incompatible {
                    name: info.name,
                    port: port + 1,
                });
            }
        }

        let old = self.active[port];
        if let Some(dev) = self.devices.get_mut(&old) {
            if let Err(e) = dev.enable(port, false, ctx) {
                log::warn!("tapeport {}: disabling {}: {e}", port + 1, dev.info().name);
            }
        }
        self.active[port] = TAPEPORT_DEVICE_NONE;

        if let Some(dev) = self.devices.get_mut(&id) {
            dev.enable(port, true, ctx)?;
            log::debug!("tapeport {}: {}", port + 1, dev.info().name);
        }
        self.active[port] = id;
        Ok(())
    }

    /// Devices usable on `port`, optionally sorted by type then name.
    #[must_use]
    pub fn valid_devices(&self, port: usize, sort: bool) -> Vec<TapeportDeviceEntry> {
        let mut list: Vec<TapeportDeviceEntry> = self
            .devices
            .iter()
            .map(|(&id, d)| TapeportDeviceEntry { id, info: d.info() })
            .filter(|e| port < TAPEPORT_MAX_PORTS && self.compatible(&e.info, port))
            .collect();
        if sort {
            list.sort_by(|a, b| {
                (a.info.device_type, a.info.name).cmp(&(b.info.device_type, b.info.name))
            });
        }
        list
    }

    fn active_device(&mut self, port: usize) -> Option<&mut Box<dyn TapeportDevice>> {
        let id = *self.active.get(port)?;
        self.devices.get_mut(&id)
    }

    pub fn set_motor(&mut self, port: usize, on: bool, ctx: &mut TapeContext<'_>) {
        if let Some(dev) = self.active_device(port) {
            dev.set_motor(port, on, ctx);
        }
    }

    pub fn toggle_write_bit(&mut self, port: usize, bit: bool, ctx: &mut TapeContext<'_>) {
        if let Some(dev) = self.active_device(port) {
            dev.toggle_write_bit(port, bit, ctx);
        }
    }

    pub fn set_sense_out(&mut self, port: usize, sense: bool, ctx: &mut TapeContext<'_>) {
        if let Some(dev) = self.active_device(port) {
            dev.set_sense_out(port, sense, ctx);
        }
    }

    pub fn reset(&mut self, ctx: &mut TapeContext<'_>) {
        for port in 0..TAPEPORT_MAX_PORTS {
            if let Some(dev) = self.active_device(port) {
                dev.reset(port, ctx);
            }
        }
    }

    fn module_name(port: usize) -> &'static str {
        if port == 0 { "TAPEPORT" } else { "TAPEPORT2" }
    }

    /// One `TAPEPORT` module per port, each followed by the device's own.
    pub fn write_snapshot(
        &self,
        snap: &mut Snapshot,
        alarms: &AlarmContext,
    ) -> Result<(), SnapshotError> {
        for port in 0..TAPEPORT_MAX_PORTS {
            let id = self.active[port];
            snap.module_writer(Self::module_name(port), SNAPSHOT_VERSION)?
                .write_u32(id);
            if let Some(dev) = self.devices.get(&id) {
                dev.write_snapshot(port, snap, alarms)?;
            }
        }
        Ok(())
    }

    pub fn read_snapshot(
        &mut self,
        snap: &Snapshot,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), SnapshotError> {
        for port in 0..TAPEPORT_MAX_PORTS {
            let mut m = snap.module(Self::module_name(port))?;
            m.check_version(SNAPSHOT_VERSION)?;
            let id = m.read_u32()?;
            self.set_device(port, id, ctx)
                .map_err(|e| m.invalid(e.to_string()))?;
            if let Some(dev) = self.devices.get_mut(&id) {
                dev.read_snapshot(port, snap, ctx)?;
            }
        }
        Ok(())
    }
}
