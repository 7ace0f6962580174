//! Datasette: TAP gaps turned into timed flux changes on the read line.
//!
//! Each tape port has its own transport with one alarm. While the motor
//! runs in PLAY the alarm fires once per gap: it pulses the read line,
//! fetches the next gap and re-arms itself that many cycles later. FORWARD
//! and REWIND walk the same gaps without pulsing, scaled by the winding
//! speed of the reels. RECORD is driven the other way, by edges on the
//! write line.
//!
//! # Motor
//!
//! | Event | Effect |
//! |-------|--------|
//! | Motor on | Cancel a pending stop; if it was off, first alarm `MOTOR_DELAY` later |
//! | Motor off | Stop takes effect `MOTOR_DELAY` later |
//! | FORWARD/REWIND | First alarm `MOTOR_DELAY_FAST` later |
//!
//! # Long gaps
//!
//! Gaps longer than [`DATASETTE_MAX_GAP`] are split; the remainder is kept
//! in `long_gap_pending` and no flux change is emitted when it is played.
//! `long_gap_elapsed` tracks how much of the current gap has passed so a
//! change of direction can resume from the middle of it.

mod realism;

use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

use emu_core::{AlarmContext, AlarmId, Snapshot, SnapshotError, SnapshotVersion};
use format_c64_tap::{Direction, MIN_PULSE, TapError, TapImage};

use crate::config::DatasetteConfig;
use crate::error::TapeportError;
use crate::tapeport::{
    MACHINE_ALL, PORT_ALL, TAPEPORT_MAX_PORTS, TapeContext, TapeLines, TapeportDevice,
    TapeportDeviceInfo, TapeportDeviceType,
};
use realism::Realism;

/// Motor spin-up and run-down time in cycles.
pub const MOTOR_DELAY: u64 = 32_000;
/// Spin-up time when winding.
pub const MOTOR_DELAY_FAST: u64 = 1_000;
/// Longest gap played in one step.
pub const DATASETTE_MAX_GAP: u64 = 100_000;

// Tape mechanics in SI units: tape thickness, empty reel radius, play
// speed, counter gear ratio, reel revolutions per second when winding.
const DS_D: f64 = 1.27e-5;
const DS_R: f64 = 1.07e-2;
const DS_V_PLAY: f64 = 4.76e-2;
const DS_G: f64 = 0.525;
const DS_RPS_FAST: f64 = 2.95;

const DS_C1: f64 = DS_V_PLAY / DS_D / PI;
const DS_C2: f64 = (DS_R * DS_R) / (DS_D * DS_D);
const DS_C3: f64 = DS_R / DS_D;

const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 5);

/// Transport state, as selected by the buttons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatasetteMode {
    #[default]
    Stop,
    Start,
    Forward,
    Rewind,
    Record,
}

impl DatasetteMode {
    const fn to_u8(self) -> u8 {
        match self {
            DatasetteMode::Stop => 0,
            DatasetteMode::Start => 1,
            DatasetteMode::Forward => 2,
            DatasetteMode::Rewind => 3,
            DatasetteMode::Record => 4,
        }
    }

    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DatasetteMode::Stop),
            1 => Some(DatasetteMode::Start),
            2 => Some(DatasetteMode::Forward),
            3 => Some(DatasetteMode::Rewind),
            4 => Some(DatasetteMode::Record),
            _ => None,
        }
    }
}

/// Button presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetteCommand {
    Stop,
    Start,
    Forward,
    Rewind,
    Record,
    /// Stop, rewind to the start and zero the counter.
    Reset,
    /// Make the counter read 000 at the current position.
    ResetCounter,
}

impl From<DatasetteMode> for DatasetteCommand {
    fn from(mode: DatasetteMode) -> Self {
        match mode {
            DatasetteMode::Stop => DatasetteCommand::Stop,
            DatasetteMode::Start => DatasetteCommand::Start,
            DatasetteMode::Forward => DatasetteCommand::Forward,
            DatasetteMode::Rewind => DatasetteCommand::Rewind,
            DatasetteMode::Record => DatasetteCommand::Record,
        }
    }
}

/// How gap bytes map to flux changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TapeBehaviour {
    #[default]
    Regular,
    /// C16/+4: every gap is a half-wave.
    C16,
}

struct DatasettePort {
    alarm: AlarmId,
    enabled: bool,
    image: Option<TapImage>,
    /// Mode of the attached image.
    mode: DatasetteMode,
    /// Mode when no image is attached.
    notape_mode: DatasetteMode,
    motor: bool,
    motor_stop_clk: u64,
    last_write_clk: u64,
    last_write_bit: bool,
    long_gap_pending: u64,
    long_gap_elapsed: u64,
    last_direction: i8,
    counter_offset: u32,
    fullwave: bool,
    fullwave_gap: u64,
    realism: Realism,
}

impl DatasettePort {
    fn new(alarm: AlarmId, seed: u64) -> Self {
        Self {
            alarm,
            enabled: false,
            image: None,
            mode: DatasetteMode::Stop,
            notape_mode: DatasetteMode::Stop,
            motor: false,
            motor_stop_clk: 0,
            last_write_clk: 0,
            last_write_bit: false,
            long_gap_pending: 0,
            long_gap_elapsed: 0,
            last_direction: 0,
            counter_offset: 0,
            fullwave: false,
            fullwave_gap: 0,
            realism: Realism::new(seed),
        }
    }

    fn mode(&self) -> DatasetteMode {
        if self.image.is_some() {
            self.mode
        } else {
            self.notape_mode
        }
    }

    fn set_mode(&mut self, mode: DatasetteMode) {
        if self.image.is_some() {
            self.mode = mode;
        } else {
            self.notape_mode = mode;
        }
    }

    /// Drive sense only while this device owns the port.
    fn drive_sense(&self, port: usize, pressed: bool, lines: &mut TapeLines) {
        if self.enabled {
            lines.set_tape_sense(port, pressed);
        }
    }
}

/// Reel turns shown on the counter after `cycle_counter` units of tape.
fn counter_turns(cycle_counter: u64, cycles_per_sec: u64) -> i64 {
    let secs = cycle_counter as f64 / (cycles_per_sec as f64 / 8.0);
    (DS_G * ((secs * DS_C1 + DS_C2).sqrt() - DS_C3)) as i64
}

/// Tape speed when winding with `wound` units on the take-up reel.
fn winding_speed(wound: u64, cycles_per_sec: u64) -> f64 {
    DS_RPS_FAST / DS_G
        * (4.0 * PI * DS_D * DS_V_PLAY / cycles_per_sec as f64 * 8.0 * wound as f64
            + 4.0 * PI * PI * DS_R * DS_R)
            .sqrt()
}

fn module_name(port: usize) -> &'static str {
    if port == 0 { "DATASETTE" } else { "DATASETTE2" }
}

/// Both tape transports.
pub struct Datasette {
    config: DatasetteConfig,
    cycles_per_sec: u64,
    behaviour: TapeBehaviour,
    ports: [DatasettePort; TAPEPORT_MAX_PORTS],
}

impl Datasette {
    /// Create the transports and their alarms.
    pub fn new(config: DatasetteConfig, cycles_per_sec: u64, alarms: &mut AlarmContext) -> Self {
        Self {
            config,
            cycles_per_sec,
            behaviour: TapeBehaviour::Regular,
            ports: [
                DatasettePort::new(alarms.new_alarm("Datasette"), 1),
                DatasettePort::new(alarms.new_alarm("Datasette2"), 2),
            ],
        }
    }

    #[must_use]
    pub fn config(&self) -> &DatasetteConfig {
        &self.config
    }

    /// Replace the tuning. Values are expected to be validated already.
    pub fn set_config(&mut self, config: DatasetteConfig) {
        self.config = config;
    }

    pub fn set_cycles_per_sec(&mut self, cycles_per_sec: u64) {
        self.cycles_per_sec = cycles_per_sec;
    }

    #[must_use]
    pub fn behaviour(&self) -> TapeBehaviour {
        self.behaviour
    }

    pub fn set_behaviour(&mut self, behaviour: TapeBehaviour) {
        self.behaviour = behaviour;
    }

    /// Port whose alarm is `alarm`.
    #[must_use]
    pub fn alarm_port(&self, alarm: AlarmId) -> Option<usize> {
        self.ports.iter().position(|p| p.alarm == alarm)
    }

    #[must_use]
    pub fn alarm(&self, port: usize) -> AlarmId {
        self.ports[port].alarm
    }

    #[must_use]
    pub fn motor(&self, port: usize) -> bool {
        self.ports[port].motor
    }

    #[must_use]
    pub fn mode(&self, port: usize) -> DatasetteMode {
        self.ports[port].mode()
    }

    #[must_use]
    pub fn is_enabled(&self, port: usize) -> bool {
        self.ports[port].enabled
    }

    #[must_use]
    pub fn image(&self, port: usize) -> Option<&TapImage> {
        self.ports[port].image.as_ref()
    }

    #[must_use]
    pub fn long_gap_pending(&self, port: usize) -> u64 {
        self.ports[port].long_gap_pending
    }

    /// Value on the 3-digit counter.
    #[must_use]
    pub fn counter(&self, port: usize) -> u32 {
        let p = &self.ports[port];
        match &p.image {
            Some(image) => image.counters.counter,
            None => (1000 - p.counter_offset.min(1000)) % 1000,
        }
    }

    /// The port was selected on or removed from the tape port.
    pub fn set_enabled(&mut self, port: usize, on: bool, lines: &mut TapeLines) {
        let p = &mut self.ports[port];
        p.enabled = on;
        let pressed = on && p.mode() != DatasetteMode::Stop;
        lines.set_tape_sense(port, pressed);
    }

    /// Insert `image`, ejecting any tape already in the port.
    pub fn attach(
        &mut self,
        port: usize,
        image: TapImage,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), TapError> {
        self.detach(port, ctx)?;
        log::info!("datasette {}: attached {}", port + 1, image.path().display());
        self.ports[port].image = Some(image);
        self.internal_reset(port, ctx);

        // Walk the tape once for its length, which the counter needs.
        if let Some(image) = self.ports[port].image.as_mut() {
            image.counters.cycle_counter_total = 0;
        }
        loop {
            let gap = self.read_gap(port, Direction::Forward);
            if gap == 0 {
                break;
            }
            if let Some(image) = self.ports[port].image.as_mut() {
                image.counters.cycle_counter_total += gap / 8;
            }
        }

        let p = &mut self.ports[port];
        if let Some(image) = p.image.as_mut() {
            image.seek_start();
        }
        p.realism.reset();
        p.fullwave = false;
        p.drive_sense(port, false, ctx.lines);
        Ok(())
    }

    /// Eject the tape, writing back its length if it was recorded on.
    pub fn detach(&mut self, port: usize, ctx: &mut TapeContext<'_>) -> Result<(), TapError> {
        let Some(image) = self.ports[port].image.take() else {
            return Ok(());
        };
        log::info!("datasette {}: detached {}", port + 1, image.path().display());
        self.internal_reset(port, ctx);
        let p = &mut self.ports[port];
        p.fullwave = false;
        p.drive_sense(port, false, ctx.lines);
        image.close()
    }

    /// Press a button.
    pub fn control(&mut self, port: usize, command: DatasetteCommand, ctx: &mut TapeContext<'_>) {
        log::debug!("datasette {}: {command:?}", port + 1);
        match command {
            DatasetteCommand::ResetCounter => self.reset_counter(port),
            DatasetteCommand::Reset => {
                self.internal_reset(port, ctx);
                self.stop(port, ctx);
            }
            DatasetteCommand::Stop => self.stop(port, ctx),
            DatasetteCommand::Start => self.run(port, DatasetteMode::Start, ctx),
            DatasetteCommand::Forward => self.wind(port, DatasetteMode::Forward, ctx),
            DatasetteCommand::Rewind => self.wind(port, DatasetteMode::Rewind, ctx),
            DatasetteCommand::Record => {
                let p = &mut self.ports[port];
                match &p.image {
                    Some(image) if !image.is_read_only() => {
                        p.mode = DatasetteMode::Record;
                        p.drive_sense(port, true, ctx.lines);
                        p.last_write_clk = 0;
                    }
                    Some(image) => {
                        log::warn!(
                            "datasette {}: {} is read-only, not recording",
                            port + 1,
                            image.path().display()
                        );
                    }
                    None => {}
                }
            }
        }
        if let Some(image) = self.ports[port].image.as_mut() {
            image.clear_buffer();
        }
    }

    fn stop(&mut self, port: usize, ctx: &mut TapeContext<'_>) {
        let p = &mut self.ports[port];
        p.set_mode(DatasetteMode::Stop);
        p.drive_sense(port, false, ctx.lines);
        p.last_write_clk = 0;
    }

    fn run(&mut self, port: usize, mode: DatasetteMode, ctx: &mut TapeContext<'_>) {
        let p = &mut self.ports[port];
        p.set_mode(mode);
        p.drive_sense(port, true, ctx.lines);
        p.last_write_clk = 0;
        if p.motor {
            self.start_motor(port, ctx);
        }
    }

    fn wind(&mut self, port: usize, mode: DatasetteMode, ctx: &mut TapeContext<'_>) {
        let at = ctx.alarms.now() + MOTOR_DELAY_FAST;
        ctx.alarms.set(self.ports[port].alarm, at);
        self.run(port, mode, ctx);
    }

    fn start_motor(&mut self, port: usize, ctx: &mut TapeContext<'_>) {
        let now = ctx.alarms.now();
        let p = &mut self.ports[port];
        if let Some(image) = p.image.as_mut() {
            if let Err(e) = image.sync_file_position() {
                log::error!("datasette {}: cannot seek tape: {e}", port + 1);
            }
        }
        if !ctx.alarms.is_pending(p.alarm) {
            ctx.alarms.set(p.alarm, now + MOTOR_DELAY);
        }
        if p.last_write_clk == 0 {
            // Recording starts as if the write line had been low, so the
            // first rising edge writes a (long) leading gap.
            p.last_write_clk = now;
            p.last_write_bit = false;
        }
    }

    /// Motor line from the CPU port.
    pub fn set_motor(&mut self, port: usize, on: bool, ctx: &mut TapeContext<'_>) {
        let now = ctx.alarms.now();
        let p = &mut self.ports[port];
        if on {
            p.motor_stop_clk = 0;
            if !p.motor {
                log::debug!("datasette {}: motor on", port + 1);
                p.last_write_clk = 0;
                p.motor = true;
                self.start_motor(port, ctx);
            }
        } else if p.motor && p.motor_stop_clk == 0 {
            p.motor_stop_clk = now + MOTOR_DELAY;
            if !ctx.alarms.is_pending(p.alarm) {
                ctx.alarms.set(p.alarm, p.motor_stop_clk);
            }
        }
    }

    /// Machine reset. Only acts when the datasette resets with the CPU.
    pub fn reset(&mut self, port: usize, ctx: &mut TapeContext<'_>) {
        if self.config.reset_with_cpu {
            self.internal_reset(port, ctx);
        }
    }

    fn internal_reset(&mut self, port: usize, ctx: &mut TapeContext<'_>) {
        let p = &self.ports[port];
        if matches!(
            p.mode(),
            DatasetteMode::Start | DatasetteMode::Forward | DatasetteMode::Rewind
        ) {
            ctx.alarms.unset(p.alarm);
        }
        let command = if p.image.is_some() {
            DatasetteCommand::Stop
        } else {
            p.notape_mode.into()
        };
        self.control(port, command, ctx);

        let p = &mut self.ports[port];
        if let Some(image) = p.image.as_mut() {
            image.seek_start();
            image.counters.cycle_counter = 0;
        }
        p.counter_offset = 0;
        p.long_gap_pending = 0;
        p.long_gap_elapsed = 0;
        p.last_direction = 0;
        p.motor_stop_clk = 0;
        p.fullwave = false;
        self.update_counter(port);
    }

    fn reset_counter(&mut self, port: usize) {
        let cps = self.cycles_per_sec;
        let p = &mut self.ports[port];
        p.counter_offset = match &p.image {
            None => 1000,
            Some(image) => {
                (1000 + counter_turns(image.counters.cycle_counter, cps)).rem_euclid(1000) as u32
            }
        };
        self.update_counter(port);
    }

    fn update_counter(&mut self, port: usize) {
        let cps = self.cycles_per_sec;
        let p = &mut self.ports[port];
        if let Some(image) = p.image.as_mut() {
            let turns = counter_turns(image.counters.cycle_counter, cps);
            image.counters.counter =
                (1000 - i64::from(p.counter_offset) + turns).rem_euclid(1000) as u32;
        }
    }

    /// Next gap in `direction` with wobble and azimuth error applied; 0 at
    /// either end of the tape.
    fn read_gap(&mut self, port: usize, direction: Direction) -> u64 {
        let zero_gap_delay = u64::from(self.config.zero_gap_delay);
        let cps = self.cycles_per_sec;
        let c16 = self.behaviour == TapeBehaviour::C16;
        let config = &self.config;
        let p = &mut self.ports[port];
        let Some(image) = p.image.as_mut() else {
            return 0;
        };
        let version = image.version();

        // C16 v1 images store full waves: each gap is played twice.
        if c16 && version == 1 && p.fullwave {
            p.fullwave = false;
            return p.fullwave_gap;
        }

        let total = image.counters.cycle_counter_total;
        let gap = image
            .read_gap(direction, zero_gap_delay)
            .map_or(0, |g| p.realism.apply(g, total, cps, config));
        if gap == 0 || !c16 || version == 0 {
            return gap;
        }
        p.fullwave = !p.fullwave;
        if version == 1 {
            p.fullwave_gap = gap;
            gap
        } else {
            gap * 2
        }
    }

    /// Alarm handler for `port`. `offset` is how late the alarm fired.
    pub fn read_bit(&mut self, port: usize, offset: u64, ctx: &mut TapeContext<'_>) {
        let now = ctx.alarms.now();
        let cps = self.cycles_per_sec;
        let p = &mut self.ports[port];
        ctx.alarms.unset(p.alarm);

        if p.motor_stop_clk > 0 {
            if now >= p.motor_stop_clk {
                log::debug!("datasette {}: motor stopped", port + 1);
                p.motor_stop_clk = 0;
                p.motor = false;
            } else {
                ctx.alarms.set(p.alarm, p.motor_stop_clk);
            }
        }
        if !p.motor {
            return;
        }

        let Some(image) = p.image.as_ref() else {
            if p.notape_mode == DatasetteMode::Stop && p.motor_stop_clk > 0 {
                ctx.alarms.set(p.alarm, p.motor_stop_clk);
            }
            return;
        };

        let counters = image.counters;
        let (speed, direction) = match p.mode {
            DatasetteMode::Start => {
                if p.long_gap_pending == 0 && p.enabled {
                    ctx.lines.trigger_flux_change(port, p.fullwave);
                }
                (DS_V_PLAY, Direction::Forward)
            }
            DatasetteMode::Forward => (
                winding_speed(counters.cycle_counter, cps),
                Direction::Forward,
            ),
            DatasetteMode::Rewind => (
                winding_speed(
                    counters
                        .cycle_counter_total
                        .saturating_sub(counters.cycle_counter),
                    cps,
                ),
                Direction::Backward,
            ),
            DatasetteMode::Record | DatasetteMode::Stop => return,
        };
        let sign = direction.sign() as i8;

        if sign + p.last_direction == 0 {
            // Reversed: re-read the gap under the head and play back only
            // the part already passed.
            let gap = self.read_gap(port, direction);
            let p = &mut self.ports[port];
            p.long_gap_pending = p.long_gap_elapsed;
            p.long_gap_elapsed = gap.saturating_sub(p.long_gap_elapsed);
        }

        let mut gap = if self.ports[port].long_gap_pending > 0 {
            std::mem::take(&mut self.ports[port].long_gap_pending)
        } else {
            let gap = self.read_gap(port, direction);
            if gap > 0 {
                self.ports[port].long_gap_elapsed = 0;
            }
            gap
        };

        if gap == 0 {
            log::debug!("datasette {}: end of tape", port + 1);
            self.control(port, DatasetteCommand::Stop, ctx);
            return;
        }

        let p = &mut self.ports[port];
        if gap > DATASETTE_MAX_GAP {
            p.long_gap_pending = gap - DATASETTE_MAX_GAP;
            gap = DATASETTE_MAX_GAP;
        }
        p.long_gap_elapsed += gap;
        p.last_direction = sign;

        if let Some(image) = p.image.as_mut() {
            let c = &mut image.counters;
            c.cycle_counter = match direction {
                Direction::Forward => c.cycle_counter + gap / 8,
                Direction::Backward => c.cycle_counter.saturating_sub(gap / 8),
            };
        }
        log::trace!("datasette {}: gap {gap} at {now}", port + 1);

        let remaining = gap as i64 - offset as i64;
        let at = if remaining > 0 {
            now + (remaining as f64 * (DS_V_PLAY / speed)) as u64
        } else {
            // The change already happened while the clock jumped.
            now
        };
        ctx.alarms.set(p.alarm, at);
        self.update_counter(port);
    }

    /// Write line from the CPU port. A rising edge while recording ends a
    /// pulse.
    pub fn toggle_write_bit(&mut self, port: usize, bit: bool, ctx: &mut TapeContext<'_>) {
        let now = ctx.alarms.now();
        let p = &mut self.ports[port];
        let recording = p.image.is_some() && p.mode == DatasetteMode::Record && p.motor;
        if recording && !p.last_write_bit && bit {
            if p.last_write_clk >= now {
                p.last_write_clk = now;
            } else {
                self.bit_write(port, ctx);
            }
        }
        self.ports[port].last_write_bit = bit;
    }

    fn bit_write(&mut self, port: usize, ctx: &mut TapeContext<'_>) {
        let now = ctx.alarms.now();
        let c16 = self.behaviour == TapeBehaviour::C16;
        let p = &mut self.ports[port];
        let mut pulse = now - p.last_write_clk;
        p.last_write_clk = now;
        // C16 TAPs count in half machine cycles.
        if c16 {
            pulse /= 2;
        }
        if pulse < MIN_PULSE {
            return;
        }
        let Some(image) = p.image.as_mut() else {
            return;
        };
        if let Err(e) = image.write_pulse(pulse) {
            log::error!("datasette {}: write failed, stopping tape: {e}", port + 1);
            self.control(port, DatasetteCommand::Stop, ctx);
            return;
        }
        let units = if c16 { 2 * (pulse / 8) } else { pulse / 8 };
        let c = &mut image.counters;
        c.cycle_counter += units;
        c.cycle_counter_total = c.cycle_counter_total.max(c.cycle_counter);
        self.update_counter(port);
    }

    pub fn write_snapshot(
        &self,
        port: usize,
        snap: &mut Snapshot,
        alarms: &AlarmContext,
    ) -> Result<(), SnapshotError> {
        let p = &self.ports[port];
        let c = &self.config;
        let alarm_clk = alarms.pending(p.alarm);
        snap.module_writer(module_name(port), SNAPSHOT_VERSION)?
            .write_bool(p.motor)
            .write_u8(p.notape_mode.to_u8())
            .write_u64(p.last_write_clk)
            .write_u64(p.motor_stop_clk)
            .write_bool(alarm_clk.is_some())
            .write_u64(alarm_clk.unwrap_or(u64::MAX))
            .write_u64(p.long_gap_pending)
            .write_u64(p.long_gap_elapsed)
            .write_u8(p.last_direction as u8)
            .write_u32(p.counter_offset)
            .write_bool(c.reset_with_cpu)
            .write_u32(c.zero_gap_delay)
            .write_i32(c.speed_tuning)
            .write_u32(c.wobble_frequency)
            .write_u32(c.wobble_amplitude)
            .write_u32(c.azimuth_error)
            .write_bool(p.fullwave)
            .write_u64(p.fullwave_gap);
        Ok(())
    }

    pub fn read_snapshot(
        &mut self,
        port: usize,
        snap: &Snapshot,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), SnapshotError> {
        let mut m = snap.module(module_name(port))?;
        m.check_version(SNAPSHOT_VERSION)?;

        let motor = m.read_bool()?;
        let notape_mode =
            DatasetteMode::from_u8(m.read_u8()?).ok_or_else(|| m.invalid("bad tape mode"))?;
        let last_write_clk = m.read_u64()?;
        let motor_stop_clk = m.read_u64()?;
        let alarm_pending = m.read_bool()?;
        let alarm_clk = m.read_u64()?;
        let long_gap_pending = m.read_u64()?;
        let long_gap_elapsed = m.read_u64()?;
        let last_direction = m.read_u8()? as i8;
        let counter_offset = m.read_u32()?;
        let config = DatasetteConfig {
            reset_with_cpu: m.read_bool()?,
            zero_gap_delay: m.read_u32()?,
            speed_tuning: m.read_i32()?,
            wobble_frequency: m.read_u32()?,
            wobble_amplitude: m.read_u32()?,
            azimuth_error: m.read_u32()?,
            sound: self.config.sound,
        };
        config.validate().map_err(|e| m.invalid(e.to_string()))?;
        let fullwave = m.read_bool()?;
        let fullwave_gap = m.read_u64()?;

        self.config = config;
        let p = &mut self.ports[port];
        p.motor = motor;
        p.notape_mode = notape_mode;
        p.last_write_clk = last_write_clk;
        p.motor_stop_clk = motor_stop_clk;
        p.long_gap_pending = long_gap_pending;
        p.long_gap_elapsed = long_gap_elapsed;
        p.last_direction = last_direction.clamp(-1, 1);
        p.counter_offset = counter_offset.min(1000);
        p.fullwave = fullwave;
        p.fullwave_gap = fullwave_gap;

        if alarm_pending {
            ctx.alarms.set(p.alarm, alarm_clk);
        } else {
            ctx.alarms.unset(p.alarm);
        }
        if let Some(image) = p.image.as_mut() {
            image.clear_buffer();
            let pressed = p.mode != DatasetteMode::Stop;
            p.drive_sense(port, pressed, ctx.lines);
        }
        self.update_counter(port);
        Ok(())
    }
}

/// The datasette as seen by the tape port registry.
pub struct DatasetteDevice(Rc<RefCell<Datasette>>);

impl DatasetteDevice {
    #[must_use]
    pub fn new(datasette: &Rc<RefCell<Datasette>>) -> Self {
        Self(Rc::clone(datasette))
    }
}

impl TapeportDevice for DatasetteDevice {
    fn info(&self) -> TapeportDeviceInfo {
        TapeportDeviceInfo {
            name: "Datasette",
            device_type: TapeportDeviceType::Tape,
            machine_mask: MACHINE_ALL,
            port_mask: PORT_ALL,
        }
    }

    fn enable(
        &mut self,
        port: usize,
        on: bool,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), TapeportError> {
        self.0.borrow_mut().set_enabled(port, on, ctx.lines);
        Ok(())
    }

    fn reset(&mut self, port: usize, ctx: &mut TapeContext<'_>) {
        self.0.borrow_mut().reset(port, ctx);
    }

    fn set_motor(&mut self, port: usize, on: bool, ctx: &mut TapeContext<'_>) {
        self.0.borrow_mut().set_motor(port, on, ctx);
    }

    fn toggle_write_bit(&mut self, port: usize, bit: bool, ctx: &mut TapeContext<'_>) {
        self.0.borrow_mut().toggle_write_bit(port, bit, ctx);
    }

    fn write_snapshot(
        &self,
        port: usize,
        snap: &mut Snapshot,
        alarms: &AlarmContext,
    ) -> Result<(), SnapshotError> {
        self.0.borrow().write_snapshot(port, snap, alarms)
    }

    fn read_snapshot(
        &mut self,
        port: usize,
        snap: &Snapshot,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), SnapshotError> {
        self.0.borrow_mut().read_snapshot(port, snap, ctx)
    }
}
