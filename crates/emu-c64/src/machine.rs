//! The assembled C64/C128.
//!
//! A [`Machine`] owns the clock, the memory map, the I/O router and every
//! chip behind it. The host's CPU core drives it through [`Bus`] and calls
//! [`advance`](Machine::advance) with the cycles it used; alarms that came
//! due in that span are dispatched to the subsystem that armed them.
//!
//! # I/O map
//!
//! | Range         | Source                    | Priority |
//! |---------------|---------------------------|----------|
//! | $D000-$D3FF   | VIC-II (minus expansion windows) | High |
//! | $D400-$D41F   | SID                       | High     |
//! | $D420-$D7FF   | SID mirrors ($D4FF on C128) | Low    |
//! | $D600-$D7FF   | VDC (C128 only)           | Normal   |
//! | $D800-$DBFF   | Colour RAM (direct)       |          |
//! | $DC00-$DCFF   | CIA1                      | High     |
//! | $DD00-$DDFF   | CIA2                      | High     |
//!
//! The 6510 port drives tape port 1: bit 5 is the motor (low = on), bit 3
//! the write line, and bit 4 reads the sense line.

use std::cell::{Ref, RefCell};
use std::path::Path;
use std::rc::Rc;

use emu_core::{
    AlarmContext, AlarmHandler, AlarmId, Bus, Observable, Snapshot, SnapshotVersion, Ticks, Value,
};
use format_c64_tap::TapImage;

use crate::cia::Cia;
use crate::config::{C64Model, MachineConfig, MachineTiming, Roms, TimingStandard};
use crate::datasette::{Datasette, DatasetteCommand, DatasetteDevice};
use crate::error::{C64Error, ConfigError, MemHackError, TapeportError};
use crate::io::{CollisionMode, DetachPolicy, IoRouter, IoSource};
use crate::memhack::{MemHack, MemHackKind, VIC_DEFAULT_RANGES, read_ram_block};
use crate::memory::{C64Memory, PORT_MOTOR, PORT_SENSE, PORT_WRITE};
use crate::resources::{Resource, ResourceValue};
use crate::sid::Sid;
use crate::tapeport::{
    SenseDongle, TAPEPORT_DEVICE_DATASETTE, TAPEPORT_DEVICE_SENSE_DONGLE,
    TAPEPORT_DEVICE_TAPE_DIAG_586220_HARNESS, TAPEPORT_DEVICE_TAPE_LOG, TAPEPORT_MAX_DEVICE_ID,
    TAPEPORT_MAX_PORTS, TapeContext, TapeDiagHarness, TapeLines, TapeLog, Tapeport,
};
use crate::vdc::Vdc;
use crate::vic::VicGlue;

const SNAPSHOT_NAME: &str = "MACHINE";
const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const COLOUR_RAM: std::ops::RangeInclusive<u16> = 0xD800..=0xDBFF;

/// How far a reset reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetMode {
    /// Reset line pulled.
    Soft,
    /// Reset line pulled, with the host CPU core cold-starting.
    Hard,
    /// Power off and on: RAM and expansion latches are cleared as well.
    PowerCycle,
}

pub struct Machine {
    model: C64Model,
    timing: TimingStandard,
    alarms: AlarmContext,
    memory: C64Memory,
    io: IoRouter,
    vic: VicGlue,
    sid: Rc<RefCell<Sid>>,
    cia1: Rc<RefCell<Cia>>,
    cia2: Rc<RefCell<Cia>>,
    vdc: Option<Rc<RefCell<Vdc>>>,
    tapeport: Tapeport,
    datasette: Rc<RefCell<Datasette>>,
    tape_lines: TapeLines,
    /// 6510 port outputs last forwarded to tape port 1.
    port_lines: u8,
    sense_out: bool,
}

fn register(io: &mut IoRouter, source: IoSource) -> Result<(), C64Error> {
    let name = source.name;
    if io.register(source).is_none() {
        log::error!("cannot register {name}");
        return Err(MemHackError::IoTableFull.into());
    }
    Ok(())
}

const fn model_id(model: C64Model) -> u8 {
    match model {
        C64Model::C64 => 0,
        C64Model::C128 => 1,
    }
}

impl Machine {
    /// Build and power on a machine. The configuration is validated first.
    pub fn new(config: MachineConfig) -> Result<Self, C64Error> {
        config.validate()?;
        let model = config.model;
        let timing = config.timing.timing();

        let mut alarms = AlarmContext::new();
        let mut io = IoRouter::new();
        io.set_collision_mode(config.io_collision);

        let mut vic = VicGlue::new(model, timing, &mut alarms);
        if !vic.register(&mut io, &VIC_DEFAULT_RANGES) {
            return Err(MemHackError::IoTableFull.into());
        }

        let sid = Rc::new(RefCell::new(Sid::new()));
        for source in Sid::io_sources(&sid, model) {
            register(&mut io, source)?;
        }

        let vdc = match model {
            C64Model::C64 => None,
            C64Model::C128 => {
                let vdc = Rc::new(RefCell::new(Vdc::new()));
                register(&mut io, Vdc::io_source(&vdc))?;
                Some(vdc)
            }
        };

        let cia1 = Rc::new(RefCell::new(Cia::new("CIA1")));
        let cia2 = Rc::new(RefCell::new(Cia::new("CIA2")));
        register(&mut io, Cia::io_source(&cia1, 0xDC00))?;
        register(&mut io, Cia::io_source(&cia2, 0xDD00))?;
        vic.set_video_bank(cia2.borrow().port_a_output());

        let roms = &config.roms;
        let memory = C64Memory::new(
            &roms.kernal,
            &roms.basic,
            &roms.chargen,
            MemHack::new(&config.memhack),
        );

        let datasette = Rc::new(RefCell::new(Datasette::new(
            config.datasette.clone(),
            timing.cycles_per_sec,
            &mut alarms,
        )));
        let mut tapeport = Tapeport::new(model);
        tapeport.register(
            TAPEPORT_DEVICE_DATASETTE,
            Box::new(DatasetteDevice::new(&datasette)),
        )?;
        tapeport.register(TAPEPORT_DEVICE_SENSE_DONGLE, Box::new(SenseDongle))?;
        tapeport.register(
            TAPEPORT_DEVICE_TAPE_DIAG_586220_HARNESS,
            Box::new(TapeDiagHarness::default()),
        )?;
        tapeport.register(TAPEPORT_DEVICE_TAPE_LOG, Box::new(TapeLog::default()))?;

        let mut machine = Self {
            model,
            timing: config.timing,
            alarms,
            memory,
            io,
            vic,
            sid,
            cia1,
            cia2,
            vdc,
            tapeport,
            datasette,
            tape_lines: TapeLines::default(),
            port_lines: 0,
            sense_out: false,
        };
        machine.memory.power_on();
        machine.latch_port_lines();

        for (port, id) in [config.tapeport.port1_device, config.tapeport.port2_device]
            .into_iter()
            .enumerate()
        {
            machine.set_tapeport_device(port, id)?;
        }
        machine
            .memory
            .hack
            .switch(config.memhack.kind, &mut machine.io, &mut machine.vic)?;

        log::info!(
            "{model:?} {:?} machine ready, {} I/O sources",
            config.timing,
            machine.io.len()
        );
        Ok(machine)
    }

    /// Load a JSON configuration file and build the machine with `roms`.
    pub fn from_config_file(path: impl AsRef<Path>, roms: Roms) -> Result<Self, C64Error> {
        let text = std::fs::read_to_string(path)?;
        let mut config = MachineConfig::from_json(&text)?;
        config.roms = roms;
        Self::new(config)
    }

    #[must_use]
    pub fn model(&self) -> C64Model {
        self.model
    }

    #[must_use]
    pub fn clock(&self) -> u64 {
        self.alarms.now()
    }

    #[must_use]
    pub fn alarms(&self) -> &AlarmContext {
        &self.alarms
    }

    /// Advance the clock by `cycles`. Alarms re-armed by a handler inside
    /// the span also fire inside it.
    pub fn advance(&mut self, cycles: u64) {
        let target = self.alarms.now() + cycles;
        loop {
            let now = self.alarms.now();
            let step = match self.alarms.next_pending() {
                Some(at) if at <= target => at.saturating_sub(now),
                _ => target - now,
            };
            AlarmContext::tick(self, Ticks::new(step));
            if self.alarms.now() >= target
                && self.alarms.next_pending().is_none_or(|at| at > target)
            {
                break;
            }
        }
    }

    // CPU view

    pub fn cpu_read(&mut self, addr: u16) -> u8 {
        if (0xD000..=0xDFFF).contains(&addr) && self.memory.is_io_visible() {
            return self.io_read(addr);
        }
        self.memory.cpu_read(addr)
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000 | 0x0001 => {
                self.memory.cpu_write(addr, value);
                self.update_port_lines();
            }
            0xD000..=0xDFFF if self.memory.is_io_visible() => self.io_write(addr, value),
            _ => self.memory.cpu_write(addr, value),
        }
    }

    /// Side-effect-free read, for monitors.
    #[must_use]
    pub fn peek(&self, addr: u16) -> u8 {
        if (0xD000..=0xDFFF).contains(&addr) && self.memory.is_io_visible() {
            if COLOUR_RAM.contains(&addr) {
                return self.colour_nybble(addr);
            }
            return self.io.peek(addr);
        }
        self.memory.cpu_read(addr)
    }

    fn colour_nybble(&self, addr: u16) -> u8 {
        (self.vic.phi1() & 0xF0) | self.memory.colour_ram_read(addr - 0xD800)
    }

    fn io_read(&mut self, addr: u16) -> u8 {
        if COLOUR_RAM.contains(&addr) {
            return self.colour_nybble(addr);
        }
        self.vic.sync(self.alarms.now());
        self.io.set_open_bus(self.vic.phi1());
        let value = self.io.read(addr);
        self.handle_detached();
        value
    }

    fn io_write(&mut self, addr: u16, value: u8) {
        if COLOUR_RAM.contains(&addr) {
            self.memory.colour_ram_write(addr - 0xD800, value);
            return;
        }
        self.vic.sync(self.alarms.now());
        self.io.store(addr, value);
        if (0xDD00..=0xDDFF).contains(&addr) {
            self.vic.set_video_bank(self.cia2.borrow().port_a_output());
        }
    }

    /// Act on sources the router dropped after a read collision.
    fn handle_detached(&mut self) {
        let detached = self.io.take_detached();
        if detached
            .iter()
            .any(|d| d.policy == DetachPolicy::Resource(Resource::MemoryHack.name()))
        {
            self.memory.hack.detached(&mut self.io, &mut self.vic);
        }
    }

    /// Record the current port outputs without telling the tape port.
    fn latch_port_lines(&mut self) {
        let (ddr, data) = self.memory.port_registers();
        self.port_lines = self.memory.port_outputs();
        self.sense_out = ddr & PORT_SENSE != 0 && data & PORT_SENSE != 0;
    }

    /// Forward changed 6510 port lines to tape port 1.
    fn update_port_lines(&mut self) {
        let out = self.memory.port_outputs();
        let (ddr, data) = self.memory.port_registers();
        let sense_out = ddr & PORT_SENSE != 0 && data & PORT_SENSE != 0;
        let changed = out ^ self.port_lines;
        let sense_changed = sense_out != self.sense_out;
        self.port_lines = out;
        self.sense_out = sense_out;

        let mut ctx = TapeContext {
            alarms: &mut self.alarms,
            lines: &mut self.tape_lines,
        };
        if changed & PORT_MOTOR != 0 {
            self.tapeport.set_motor(0, out & PORT_MOTOR == 0, &mut ctx);
        }
        if changed & PORT_WRITE != 0 {
            self.tapeport.toggle_write_bit(0, out & PORT_WRITE != 0, &mut ctx);
        }
        if sense_changed {
            self.tapeport.set_sense_out(0, sense_out, &mut ctx);
        }
        self.sync_tape_lines();
    }

    /// Sense to the 6510 port, flux changes to CIA1 FLAG.
    fn sync_tape_lines(&mut self) {
        self.memory.set_tape_sense(self.tape_lines.any_sense());
        let flux: u32 = (0..TAPEPORT_MAX_PORTS)
            .map(|port| self.tape_lines.take_flux_changes(port))
            .sum();
        if flux > 0 {
            self.cia1.borrow_mut().trigger_flag();
        }
    }

    // Reset and timing

    /// Reset the chips. The clock keeps running. The datasette follows only
    /// when `DatasetteResetWithCPU` is set.
    pub fn reset(&mut self, mode: ResetMode) {
        log::info!("{mode:?} reset at cycle {}", self.alarms.now());
        match mode {
            ResetMode::PowerCycle => self.memory.power_on(),
            ResetMode::Soft | ResetMode::Hard => self.memory.reset_port(),
        }
        self.vic.reset(&mut self.alarms);
        self.sid.borrow_mut().reset();
        self.cia1.borrow_mut().reset();
        self.cia2.borrow_mut().reset();
        self.vic.set_video_bank(self.cia2.borrow().port_a_output());
        if let Some(vdc) = &self.vdc {
            vdc.borrow_mut().reset();
        }

        self.update_port_lines();
        let mut ctx = TapeContext {
            alarms: &mut self.alarms,
            lines: &mut self.tape_lines,
        };
        self.tapeport.reset(&mut ctx);
        self.sync_tape_lines();
    }

    #[must_use]
    pub fn timing_standard(&self) -> TimingStandard {
        self.timing
    }

    #[must_use]
    pub fn timing(&self) -> MachineTiming {
        self.timing.timing()
    }

    /// Switch the video standard, then hard-reset.
    pub fn change_timing(&mut self, standard: TimingStandard) -> Result<(), C64Error> {
        if !standard.supported_by(self.model) {
            return Err(
                ConfigError::invalid("MachineVideoStandard", standard.resource_value()).into(),
            );
        }
        if standard == self.timing {
            return Ok(());
        }
        self.apply_timing(standard);
        self.reset(ResetMode::Hard);
        Ok(())
    }

    fn apply_timing(&mut self, standard: TimingStandard) {
        let timing = standard.timing();
        self.timing = standard;
        self.vic.set_timing(timing);
        self.datasette
            .borrow_mut()
            .set_cycles_per_sec(timing.cycles_per_sec);
        log::info!(
            "timing {standard:?}: {} Hz, {} cycles/line, {} lines",
            timing.cycles_per_sec,
            timing.cycles_per_line,
            timing.lines_per_frame
        );
    }

    /// Raster line and cycle at the current clock.
    #[must_use]
    pub fn line_cycle(&self) -> (u16, u16) {
        self.vic.line_cycle(self.alarms.now())
    }

    // Components

    #[must_use]
    pub fn memory(&self) -> &C64Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut C64Memory {
        &mut self.memory
    }

    #[must_use]
    pub fn io(&self) -> &IoRouter {
        &self.io
    }

    /// For hosts adding their own I/O sources (cartridges and the like).
    pub fn io_mut(&mut self) -> &mut IoRouter {
        &mut self.io
    }

    #[must_use]
    pub fn vic(&self) -> &VicGlue {
        &self.vic
    }

    pub fn vic_mut(&mut self) -> &mut VicGlue {
        &mut self.vic
    }

    /// VIC-II fetch of `addr14` in the current video bank.
    pub fn vic_fetch(&mut self, addr14: u16) -> u8 {
        self.vic.fetch(&self.memory, addr14)
    }

    /// Arm a light pen trigger `delay` cycles from now.
    pub fn schedule_light_pen(&mut self, delay: u64) {
        let at = self.alarms.now() + delay;
        self.vic.schedule_light_pen(&mut self.alarms, at);
    }

    #[must_use]
    pub fn memhack(&self) -> &MemHack {
        &self.memory.hack
    }

    #[must_use]
    pub fn cia1(&self) -> Ref<'_, Cia> {
        self.cia1.borrow()
    }

    #[must_use]
    pub fn cia2(&self) -> Ref<'_, Cia> {
        self.cia2.borrow()
    }

    #[must_use]
    pub fn sid(&self) -> Ref<'_, Sid> {
        self.sid.borrow()
    }

    #[must_use]
    pub fn vdc(&self) -> Option<Ref<'_, Vdc>> {
        self.vdc.as_ref().map(|v| v.borrow())
    }

    #[must_use]
    pub fn tapeport(&self) -> &Tapeport {
        &self.tapeport
    }

    #[must_use]
    pub fn tape_lines(&self) -> &TapeLines {
        &self.tape_lines
    }

    #[must_use]
    pub fn datasette(&self) -> Ref<'_, Datasette> {
        self.datasette.borrow()
    }

    // Tape

    fn check_port(port: usize) -> Result<(), C64Error> {
        if port >= TAPEPORT_MAX_PORTS {
            return Err(TapeportError::InvalidPort(port).into());
        }
        Ok(())
    }

    fn with_datasette<R>(
        &mut self,
        f: impl FnOnce(&mut Datasette, &mut TapeContext<'_>) -> R,
    ) -> R {
        let result = {
            let mut ctx = TapeContext {
                alarms: &mut self.alarms,
                lines: &mut self.tape_lines,
            };
            f(&mut self.datasette.borrow_mut(), &mut ctx)
        };
        self.sync_tape_lines();
        result
    }

    /// Insert a TAP file into the datasette on `port`.
    pub fn attach_tape(
        &mut self,
        port: usize,
        path: impl AsRef<Path>,
        read_only: bool,
    ) -> Result<(), C64Error> {
        Self::check_port(port)?;
        let image = TapImage::open(path, read_only)?;
        self.with_datasette(|ds, ctx| ds.attach(port, image, ctx))?;
        Ok(())
    }

    pub fn detach_tape(&mut self, port: usize) -> Result<(), C64Error> {
        Self::check_port(port)?;
        self.with_datasette(|ds, ctx| ds.detach(port, ctx))?;
        Ok(())
    }

    /// Write a blank TAP file and insert it.
    pub fn create_tape(&mut self, port: usize, path: impl AsRef<Path>) -> Result<(), C64Error> {
        Self::check_port(port)?;
        TapImage::create(&path)?;
        self.attach_tape(port, path, false)
    }

    /// Press a datasette key.
    pub fn datasette_control(
        &mut self,
        port: usize,
        command: DatasetteCommand,
    ) -> Result<(), C64Error> {
        Self::check_port(port)?;
        self.with_datasette(|ds, ctx| ds.control(port, command, ctx));
        Ok(())
    }

    fn set_tapeport_device(&mut self, port: usize, id: u32) -> Result<(), C64Error> {
        let result = {
            let mut ctx = TapeContext {
                alarms: &mut self.alarms,
                lines: &mut self.tape_lines,
            };
            self.tapeport.set_device(port, id, &mut ctx)
        };
        self.sync_tape_lines();
        result.map_err(Into::into)
    }

    // Resources

    /// Change a named setting. A rejected value leaves the old one in place.
    pub fn set_resource(
        &mut self,
        name: &str,
        value: impl Into<ResourceValue>,
    ) -> Result<(), C64Error> {
        let resource = Resource::from_name(name)?;
        let value = value.into();
        let name = resource.name();
        log::debug!("resource {name} = {value}");

        match resource {
            Resource::MemoryHack => {
                let kind = MemHackKind::from_resource_value(value.as_int(name)?)
                    .ok_or_else(|| ConfigError::invalid(name, &value))?;
                self.switch_memhack(kind)?;
            }
            Resource::Ram256KFilename => {
                self.set_memhack_filename(MemHackKind::Ram256K, value.as_str(name)?);
            }
            Resource::Plus60KFilename => {
                self.set_memhack_filename(MemHackKind::Plus60K, value.as_str(name)?);
            }
            Resource::Plus256KFilename => {
                self.set_memhack_filename(MemHackKind::Plus256K, value.as_str(name)?);
            }
            Resource::Ram256KBase => {
                let base: u16 = value.in_range(name, 0..=0xFFFF)?;
                if !crate::memhack::C64_256K_BASES.contains(&base) {
                    return Err(ConfigError::invalid(name, &value).into());
                }
                self.set_memhack_base(MemHackKind::Ram256K, base)?;
            }
            Resource::Plus60KBase => {
                let base: u16 = value.in_range(name, 0..=0xFFFF)?;
                if !crate::memhack::PLUS60K_BASES.contains(&base) {
                    return Err(ConfigError::invalid(name, &value).into());
                }
                self.set_memhack_base(MemHackKind::Plus60K, base)?;
            }
            Resource::DatasetteResetWithCpu
            | Resource::DatasetteZeroGapDelay
            | Resource::DatasetteSpeedTuning
            | Resource::DatasetteTapeWobbleFrequency
            | Resource::DatasetteTapeWobbleAmplitude
            | Resource::DatasetteTapeAzimuthError
            | Resource::DatasetteSound => self.set_datasette_resource(resource, &value)?,
            Resource::TapePort1Device | Resource::TapePort2Device => {
                let port = usize::from(resource == Resource::TapePort2Device);
                let id: u32 = value.in_range(name, 0..=i64::from(TAPEPORT_MAX_DEVICE_ID))?;
                self.set_tapeport_device(port, id)?;
            }
            Resource::MachineVideoStandard => {
                let standard = TimingStandard::from_resource_value(value.as_int(name)?)
                    .ok_or_else(|| ConfigError::invalid(name, &value))?;
                self.change_timing(standard)?;
            }
            Resource::IoCollisionHandling => {
                let mode = CollisionMode::from_resource_value(value.as_int(name)?)
                    .ok_or_else(|| ConfigError::invalid(name, &value))?;
                self.io.set_collision_mode(mode);
            }
        }
        Ok(())
    }

    /// Current value of a named setting.
    pub fn resource(&self, name: &str) -> Result<ResourceValue, ConfigError> {
        let resource = Resource::from_name(name)?;
        let hack = self.memory.hack.config();
        let ds = self.datasette.borrow();
        let ds = ds.config();
        let path = |kind| {
            self.memory
                .hack
                .filename(kind)
                .map_or_else(String::new, |p: &Path| p.display().to_string())
        };
        Ok(match resource {
            Resource::MemoryHack => self.memory.hack.kind().resource_value().into(),
            Resource::Ram256KFilename => path(MemHackKind::Ram256K).into(),
            Resource::Ram256KBase => i64::from(hack.c64_256k_base).into(),
            Resource::Plus60KFilename => path(MemHackKind::Plus60K).into(),
            Resource::Plus60KBase => i64::from(hack.plus60k_base).into(),
            Resource::Plus256KFilename => path(MemHackKind::Plus256K).into(),
            Resource::DatasetteResetWithCpu => ds.reset_with_cpu.into(),
            Resource::DatasetteZeroGapDelay => ds.zero_gap_delay.into(),
            Resource::DatasetteSpeedTuning => ds.speed_tuning.into(),
            Resource::DatasetteTapeWobbleFrequency => ds.wobble_frequency.into(),
            Resource::DatasetteTapeWobbleAmplitude => ds.wobble_amplitude.into(),
            Resource::DatasetteTapeAzimuthError => ds.azimuth_error.into(),
            Resource::DatasetteSound => ds.sound.into(),
            Resource::TapePort1Device => self.tapeport.device_id(0).into(),
            Resource::TapePort2Device => self.tapeport.device_id(1).into(),
            Resource::MachineVideoStandard => self.timing.resource_value().into(),
            Resource::IoCollisionHandling => self.io.collision_mode().resource_value().into(),
        })
    }

    /// Make `kind` the active RAM expansion and perform the reset it asks
    /// for. A failed switch still performs the reset its disable owes.
    fn switch_memhack(&mut self, kind: MemHackKind) -> Result<(), C64Error> {
        let (reset, result) = match self.memory.hack.switch(kind, &mut self.io, &mut self.vic) {
            Ok(reset) => (reset, Ok(())),
            Err(e) => (e.reset, Err(e.error.into())),
        };
        if let Some(mode) = reset {
            self.reset(mode);
        }
        result
    }

    fn set_memhack_filename(&mut self, kind: MemHackKind, path: &str) {
        let path = (!path.is_empty()).then(|| path.into());
        self.memory.hack.set_filename(kind, path);
    }

    /// Move an expansion's latch window, re-enabling it if it is active.
    fn set_memhack_base(&mut self, kind: MemHackKind, base: u16) -> Result<(), C64Error> {
        self.memory.hack.set_base(kind, base);
        if self.memory.hack.kind() == kind {
            self.switch_memhack(MemHackKind::None)?;
            self.switch_memhack(kind)?;
        }
        Ok(())
    }

    fn set_datasette_resource(
        &mut self,
        resource: Resource,
        value: &ResourceValue,
    ) -> Result<(), ConfigError> {
        use crate::config::DatasetteConfig as C;

        let name = resource.name();
        let mut config = self.datasette.borrow().config().clone();
        match resource {
            Resource::DatasetteResetWithCpu => config.reset_with_cpu = value.as_bool(name)?,
            Resource::DatasetteSound => config.sound = value.as_bool(name)?,
            Resource::DatasetteZeroGapDelay => {
                config.zero_gap_delay = value.in_range(name, 0..=i64::from(C::ZERO_GAP_DELAY_MAX))?;
            }
            Resource::DatasetteSpeedTuning => {
                let limit = i64::from(C::SPEED_TUNING_LIMIT);
                config.speed_tuning = value.in_range(name, -limit..=limit)?;
            }
            Resource::DatasetteTapeWobbleFrequency => {
                config.wobble_frequency =
                    value.in_range(name, 0..=i64::from(C::WOBBLE_FREQUENCY_MAX))?;
            }
            Resource::DatasetteTapeWobbleAmplitude => {
                config.wobble_amplitude =
                    value.in_range(name, 0..=i64::from(C::WOBBLE_AMPLITUDE_MAX))?;
            }
            Resource::DatasetteTapeAzimuthError => {
                config.azimuth_error = value.in_range(name, 0..=i64::from(C::AZIMUTH_ERROR_MAX))?;
            }
            _ => return Err(ConfigError::UnknownResource(name.to_string())),
        }
        config.validate()?;
        self.datasette.borrow_mut().set_config(config);
        Ok(())
    }

    // Snapshots

    /// Capture the machine: its own module, the active expansion's and one
    /// per tape port.
    pub fn save_snapshot(&self) -> Result<Snapshot, C64Error> {
        let mut snap = Snapshot::new();
        let (ddr, data) = self.memory.port_registers();
        let (cia2_pa, cia2_ddr) = self.cia2.borrow().port_a_registers();
        snap.module_writer(SNAPSHOT_NAME, SNAPSHOT_VERSION)?
            .write_u64(self.alarms.now())
            .write_u8(model_id(self.model))
            .write_u8(self.timing.resource_value() as u8)
            .write_u8(ddr)
            .write_u8(data)
            .write_u8(cia2_pa)
            .write_u8(cia2_ddr)
            .write_u8(self.memory.hack.kind().resource_value() as u8)
            .write_block(self.memory.base_ram())
            .write_block(self.memory.colour_ram());
        self.memory.hack.write_snapshot(&mut snap)?;
        self.tapeport.write_snapshot(&mut snap, &self.alarms)?;
        log::info!("snapshot taken at cycle {}", self.alarms.now());
        Ok(snap)
    }

    /// Restore a snapshot taken on a machine of the same model. Modules
    /// read before a failing one stay restored.
    pub fn load_snapshot(&mut self, snap: &Snapshot) -> Result<(), C64Error> {
        let result = self.read_snapshot(snap);
        if let Err(e) = &result {
            log::error!("snapshot load failed: {e}");
        }
        result
    }

    fn read_snapshot(&mut self, snap: &Snapshot) -> Result<(), C64Error> {
        let mut m = snap.module(SNAPSHOT_NAME)?;
        m.check_version(SNAPSHOT_VERSION)?;
        let clk = m.read_u64()?;
        let model = m.read_u8()?;
        if model != model_id(self.model) {
            return Err(m.invalid(format!("model {model}")).into());
        }
        let timing = m.read_u8()?;
        let Some(timing) = TimingStandard::from_resource_value(i64::from(timing))
            .filter(|t| t.supported_by(self.model))
        else {
            return Err(m.invalid(format!("timing {timing}")).into());
        };
        let ddr = m.read_u8()?;
        let data = m.read_u8()?;
        let cia2_pa = m.read_u8()?;
        let cia2_ddr = m.read_u8()?;
        let kind = m.read_u8()?;
        let Some(kind) = MemHackKind::from_resource_value(i64::from(kind)) else {
            return Err(m.invalid(format!("memory hack {kind}")).into());
        };
        read_ram_block(&mut m, self.memory.base_ram_mut())?;
        read_ram_block(&mut m, self.memory.colour_ram_mut())?;

        if timing != self.timing {
            self.apply_timing(timing);
        }
        self.alarms.restore(clk);
        self.memory.set_port_registers(ddr, data);
        {
            let mut cia2 = self.cia2.borrow_mut();
            cia2.write(0x02, cia2_ddr);
            cia2.write(0x00, cia2_pa);
        }
        self.vic.set_video_bank(self.cia2.borrow().port_a_output());

        // The reset the switch asks for is skipped; the saved state is the
        // state after it.
        self.memory.hack.switch(kind, &mut self.io, &mut self.vic)?;
        self.memory.hack.clear();
        self.memory.hack.read_snapshot(snap)?;
        self.memory.hack.rebind(&mut self.io, &mut self.vic)?;

        self.latch_port_lines();
        let mut ctx = TapeContext {
            alarms: &mut self.alarms,
            lines: &mut self.tape_lines,
        };
        self.tapeport.read_snapshot(snap, &mut ctx)?;
        self.sync_tape_lines();
        log::info!("snapshot restored at cycle {clk}");
        Ok(())
    }
}

impl AlarmHandler for Machine {
    fn alarm_context(&mut self) -> &mut AlarmContext {
        &mut self.alarms
    }

    fn handle_alarm(&mut self, alarm: AlarmId, offset: u64) {
        if alarm == self.vic.light_pen_alarm() {
            self.vic.handle_light_pen_alarm(self.alarms.now(), offset);
            return;
        }
        let port = self.datasette.borrow().alarm_port(alarm);
        if let Some(port) = port {
            self.with_datasette(|ds, ctx| ds.read_bit(port, offset, ctx));
            return;
        }
        log::warn!("unowned alarm {} fired", self.alarms.name(alarm));
    }
}

impl Bus for Machine {
    fn read(&mut self, address: u16) -> u8 {
        self.cpu_read(address)
    }

    fn write(&mut self, address: u16, value: u8) {
        self.cpu_write(address, value);
    }

    fn peek(&self, address: u16) -> u8 {
        Machine::peek(self, address)
    }
}

fn parse_address(s: &str) -> Option<u16> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = s.strip_prefix('$') {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl Machine {
    fn query_datasette(&self, port: usize, field: &str) -> Option<Value> {
        let ds = self.datasette.borrow();
        match field {
            "motor" => Some(ds.motor(port).into()),
            "mode" => Some(format!("{:?}", ds.mode(port)).into()),
            "counter" => Some(ds.counter(port).into()),
            "enabled" => Some(ds.is_enabled(port).into()),
            "attached" => Some(ds.image(port).is_some().into()),
            "position" => ds.image(port).map(|i| i.position().into()),
            "long_gap_pending" => Some(ds.long_gap_pending(port).into()),
            _ => None,
        }
    }
}

impl Observable for Machine {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("datasette.") {
            let (port, field) = rest.split_once('.')?;
            let port = match port {
                "1" => 0,
                "2" => 1,
                _ => return None,
            };
            self.query_datasette(port, field)
        } else if let Some(rest) = path.strip_prefix("tapeport.") {
            let port = match rest.strip_suffix(".device")? {
                "1" => 0,
                "2" => 1,
                _ => return None,
            };
            Some(self.tapeport.device_id(port).into())
        } else if let Some(rest) = path.strip_prefix("vic.") {
            let (line, cycle) = self.line_cycle();
            match rest {
                "line" => Some(line.into()),
                "cycle" => Some(cycle.into()),
                "bank" => Some(self.vic.video_bank().into()),
                "irq" => Some(self.vic.irq_active().into()),
                _ => None,
            }
        } else if let Some(rest) = path.strip_prefix("memory.") {
            parse_address(rest).map(|a| Value::U8(self.peek(a)))
        } else if let Some(rest) = path.strip_prefix("memhack.") {
            match rest {
                "state" => Some(format!("{:?}", self.memory.hack.state()).into()),
                "latch" => self.memory.hack.active().map(|e| e.latch().into()),
                _ => None,
            }
        } else {
            match path {
                "clock" => Some(self.alarms.now().into()),
                "model" => Some(format!("{:?}", self.model).into()),
                "timing" => Some(format!("{:?}", self.timing).into()),
                "memhack" => Some(self.memory.hack.kind().name().into()),
                "cia1.icr_status" => Some(self.cia1.borrow().icr_status().into()),
                "io.collision" => Some(format!("{:?}", self.io.collision_mode()).into()),
                "io.sources" => Some(Value::Array(
                    self.io
                        .sources()
                        .iter()
                        .map(|s| {
                            Value::map([
                                ("name", s.name.into()),
                                ("start", s.start.into()),
                                ("end", s.end.into()),
                            ])
                        })
                        .collect(),
                )),
                _ => None,
            }
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "clock",
            "model",
            "timing",
            "vic.line",
            "vic.cycle",
            "vic.bank",
            "vic.irq",
            "cia1.icr_status",
            "memhack",
            "memhack.state",
            "memhack.latch",
            "io.collision",
            "io.sources",
            "tapeport.{1,2}.device",
            "datasette.{1,2}.motor",
            "datasette.{1,2}.mode",
            "datasette.{1,2}.counter",
            "datasette.{1,2}.enabled",
            "datasette.{1,2}.attached",
            "datasette.{1,2}.position",
            "datasette.{1,2}.long_gap_pending",
            "memory.<address>",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cia::ICR_FLAG;
    use crate::datasette::{DatasetteMode, MOTOR_DELAY};
    use pretty_assertions::assert_eq;

    fn make_machine() -> Machine {
        Machine::new(MachineConfig::default()).expect("machine")
    }

    fn make_c128() -> Machine {
        Machine::new(MachineConfig {
            model: C64Model::C128,
            ..MachineConfig::default()
        })
        .expect("c128")
    }

    #[test]
    fn default_machine_has_datasette_on_port_one() {
        let m = make_machine();
        assert_eq!(m.tapeport().device_id(0), TAPEPORT_DEVICE_DATASETTE);
        assert_eq!(m.tapeport().device_id(1), 0);
        assert!(m.datasette().is_enabled(0));
        assert!(!m.datasette().is_enabled(1));
    }

    #[test]
    fn vic_answers_in_io_area() {
        let mut m = make_machine();
        m.cpu_write(0xD020, 0x06);
        assert_eq!(m.cpu_read(0xD020) & 0x0F, 0x06);
        // Unused registers read $FF.
        assert_eq!(m.cpu_read(0xD030), 0xFF);
    }

    #[test]
    fn io_hidden_when_banked_out() {
        let mut m = make_machine();
        m.cpu_write(0x0001, 0x30);
        m.cpu_write(0xD020, 0x42);
        assert_eq!(m.cpu_read(0xD020), 0x42);
        assert_eq!(m.memory().base_ram()[0xD020], 0x42);
    }

    #[test]
    fn colour_ram_is_a_nybble() {
        let mut m = make_machine();
        m.cpu_write(0xD800, 0xF5);
        assert_eq!(m.cpu_read(0xD800) & 0x0F, 0x05);
        assert_eq!(m.memory().colour_ram()[0], 0x05);
    }

    #[test]
    fn cia2_port_a_selects_video_bank() {
        let mut m = make_machine();
        assert_eq!(m.vic().video_bank(), 0);
        m.cpu_write(0xDD02, 0x03);
        m.cpu_write(0xDD00, 0x01);
        assert_eq!(m.vic().video_bank(), 2);
    }

    #[test]
    fn vic_fetch_follows_bank_and_char_rom() {
        let mut m = make_machine();
        m.cpu_write(0x0400, 0x20);
        m.cpu_write(0x8400, 0x21);
        assert_eq!(m.vic_fetch(0x0400), 0x20);
        m.cpu_write(0xDD02, 0x03);
        m.cpu_write(0xDD00, 0x01);
        assert_eq!(m.vic_fetch(0x0400), 0x21);
        // Open bus now carries the fetched byte.
        assert_eq!(m.cpu_read(0xD800) & 0xF0, 0x20);
    }

    #[test]
    fn c128_has_vdc_and_short_sid_mirrors() {
        let mut m = make_c128();
        assert!(m.vdc().is_some());
        assert_eq!(m.cpu_read(0xD600) & 0x80, 0x80);
        let names: Vec<&str> = m.io().sources_at(0xD500).iter().map(|s| s.name).collect();
        assert!(!names.iter().any(|n| n.starts_with("SID")));
    }

    #[test]
    fn c128_rejects_pal_n() {
        let mut m = make_c128();
        assert!(m.change_timing(TimingStandard::PalN).is_err());
        assert_eq!(m.timing_standard(), TimingStandard::Pal);
    }

    #[test]
    fn port_motor_bit_drives_datasette() {
        let mut m = make_machine();
        assert!(!m.datasette().motor(0));
        m.cpu_write(0x0001, 0x17);
        assert!(m.datasette().motor(0));
        m.cpu_write(0x0001, 0x37);
        // Motor stops only after the delay.
        m.advance(MOTOR_DELAY + 1);
        assert!(!m.datasette().motor(0));
    }

    #[test]
    fn play_key_pulls_sense_low() {
        let mut m = make_machine();
        assert_eq!(m.cpu_read(0x0001) & PORT_SENSE, PORT_SENSE);
        m.datasette_control(0, DatasetteCommand::Start).expect("start");
        assert_eq!(m.datasette().mode(0), DatasetteMode::Start);
        assert_eq!(m.cpu_read(0x0001) & PORT_SENSE, 0);
        m.datasette_control(0, DatasetteCommand::Stop).expect("stop");
        assert_eq!(m.cpu_read(0x0001) & PORT_SENSE, PORT_SENSE);
    }

    #[test]
    fn sense_dongle_holds_sense() {
        let mut m = make_machine();
        m.set_resource("TapePort1Device", 4).expect("dongle");
        assert_eq!(m.cpu_read(0x0001) & PORT_SENSE, 0);
        assert!(!m.datasette().is_enabled(0));
        m.set_resource("TapePort1Device", 0).expect("none");
        assert_eq!(m.cpu_read(0x0001) & PORT_SENSE, PORT_SENSE);
    }

    #[test]
    fn harness_loops_write_to_flag() {
        let mut m = make_machine();
        m.set_resource("TapePort1Device", 5).expect("harness");
        m.cpu_read(0xDC0D);
        m.cpu_write(0x0001, 0x3F);
        assert_eq!(m.cia1().icr_status() & ICR_FLAG, ICR_FLAG);
    }

    #[test]
    fn light_pen_alarm_latches_position() {
        let mut m = make_machine();
        m.schedule_light_pen(63 * 10 + 5);
        m.advance(1000);
        assert_eq!(m.vic().registers().peek(0x14), 10);
        assert_eq!(m.vic().registers().peek(0x13), 20);
    }

    #[test]
    fn advance_moves_clock_exactly() {
        let mut m = make_machine();
        m.advance(12_345);
        assert_eq!(m.clock(), 12_345);
        assert_eq!(m.line_cycle(), ((12_345 / 63 % 312) as u16, (12_345 % 63) as u16));
    }

    #[test]
    fn queries() {
        let mut m = make_machine();
        m.advance(100);
        assert_eq!(m.query("clock"), Some(Value::U64(100)));
        assert_eq!(m.query("datasette.1.motor"), Some(Value::Bool(false)));
        assert_eq!(m.query("tapeport.1.device"), Some(Value::U32(1)));
        assert_eq!(m.query("memhack"), Some(Value::String("none".into())));
        assert_eq!(m.query("datasette.3.motor"), None);
        assert!(matches!(m.query("io.sources"), Some(Value::Array(v)) if !v.is_empty()));
    }
}
