//! Built-in tape port devices other than the datasette.

use std::collections::VecDeque;

use super::{
    MACHINE_ALL, MACHINE_C128, MACHINE_C64, PORT_1, PORT_ALL, TapeContext, TapeportDevice,
    TapeportDeviceInfo, TapeportDeviceType,
};
use crate::error::TapeportError;

/// Holds the sense line low while plugged in, so software sees a pressed
/// PLAY key.
#[derive(Debug, Default)]
pub struct SenseDongle;

impl TapeportDevice for SenseDongle {
    fn info(&self) -> TapeportDeviceInfo {
        TapeportDeviceInfo {
            name: "Sense dongle",
            device_type: TapeportDeviceType::Dongle,
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
        ctx.lines.set_tape_sense(port, on);
        Ok(())
    }
}

/// The 586220 diagnostic harness: write looped back to read, motor looped
/// back to sense.
#[derive(Debug, Default)]
pub struct TapeDiagHarness {
    last_write: bool,
}

impl TapeportDevice for TapeDiagHarness {
    fn info(&self) -> TapeportDeviceInfo {
        TapeportDeviceInfo {
            name: "Tape diagnostic 586220 harness",
            device_type: TapeportDeviceType::Harness,
            machine_mask: MACHINE_C64 | MACHINE_C128,
            port_mask: PORT_1,
        }
    }

    fn enable(
        &mut self,
        port: usize,
        on: bool,
        ctx: &mut TapeContext<'_>,
    ) -> Result<(), TapeportError> {
        self.last_write = false;
        if !on {
            ctx.lines.set_tape_sense(port, false);
        }
        Ok(())
    }

    fn set_motor(&mut self, port: usize, on: bool, ctx: &mut TapeContext<'_>) {
        ctx.lines.set_tape_sense(port, on);
    }

    fn toggle_write_bit(&mut self, port: usize, bit: bool, ctx: &mut TapeContext<'_>) {
        if bit != self.last_write {
            ctx.lines.trigger_flux_change(port, bit);
        }
        self.last_write = bit;
    }
}

/// Which line a [`TapeLog`] entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeLogLine {
    Motor,
    Write,
    SenseOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeLogEntry {
    pub clk: u64,
    pub port: usize,
    pub line: TapeLogLine,
    pub level: bool,
}

/// Entries a [`TapeLog`] keeps before dropping the oldest.
pub const TAPE_LOG_CAPACITY: usize = 4096;

/// Logs every line change with its cycle. Only the most recent
/// [`TAPE_LOG_CAPACITY`] changes are kept.
#[derive(Debug, Default)]
pub struct TapeLog {
    entries: VecDeque<TapeLogEntry>,
}

impl TapeLog {
    /// Recorded changes, oldest first.
    #[must_use]
    pub fn entries(&self) -> &VecDeque<TapeLogEntry> {
        &self.entries
    }

    fn record(&mut self, ctx: &TapeContext<'_>, port: usize, line: TapeLogLine, level: bool) {
        let clk = ctx.alarms.now();
        log::info!("tape log: port {} {line:?} -> {} at {clk}", port + 1, u8::from(level));
        if self.entries.len() == TAPE_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(TapeLogEntry {
            clk,
            port,
            line,
            level,
        });
    }
}

impl TapeportDevice for TapeLog {
    fn info(&self) -> TapeportDeviceInfo {
        TapeportDeviceInfo {
            name: "Tape log",
            device_type: TapeportDeviceType::Harness,
            machine_mask: MACHINE_ALL,
            port_mask: PORT_ALL,
        }
    }

    fn enable(
        &mut self,
        port: usize,
        on: bool,
        _ctx: &mut TapeContext<'_>,
    ) -> Result<(), TapeportError> {
        log::info!("tape log {} on port {}", if on { "started" } else { "stopped" }, port + 1);
        if on {
            self.entries.clear();
        }
        Ok(())
    }

    fn set_motor(&mut self, port: usize, on: bool, ctx: &mut TapeContext<'_>) {
        self.record(ctx, port, TapeLogLine::Motor, on);
    }

    fn toggle_write_bit(&mut self, port: usize, bit: bool, ctx: &mut TapeContext<'_>) {
        self.record(ctx, port, TapeLogLine::Write, bit);
    }

    fn set_sense_out(&mut self, port: usize, sense: bool, ctx: &mut TapeContext<'_>) {
        self.record(ctx, port, TapeLogLine::SenseOut, sense);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tapeport::TapeLines;
    use emu_core::AlarmContext;

    #[test]
    fn sense_dongle_holds_sense_while_enabled() {
        let mut alarms = AlarmContext::new();
        let mut lines = TapeLines::default();
        let mut ctx = TapeContext { alarms: &mut alarms, lines: &mut lines };
        let mut dongle = SenseDongle;
        dongle.enable(0, true, &mut ctx).expect("enable");
        assert!(ctx.lines.sense(0));
        dongle.enable(0, false, &mut ctx).expect("disable");
        assert!(!ctx.lines.sense(0));
    }

    #[test]
    fn harness_loops_lines_back() {
        let mut alarms = AlarmContext::new();
        let mut lines = TapeLines::default();
        let mut ctx = TapeContext { alarms: &mut alarms, lines: &mut lines };
        let mut harness = TapeDiagHarness::default();
        harness.set_motor(0, true, &mut ctx);
        assert!(ctx.lines.sense(0));
        harness.toggle_write_bit(0, true, &mut ctx);
        harness.toggle_write_bit(0, true, &mut ctx);
        harness.toggle_write_bit(0, false, &mut ctx);
        assert_eq!(ctx.lines.take_flux_changes(0), 2);
    }

    #[test]
    fn tape_log_records_cycles() {
        let mut alarms = AlarmContext::new();
        let mut lines = TapeLines::default();
        let mut tlog = TapeLog::default();
        {
            let mut ctx = TapeContext { alarms: &mut alarms, lines: &mut lines };
            tlog.set_motor(0, true, &mut ctx);
        }
        assert_eq!(
            tlog.entries(),
            &[TapeLogEntry { clk: 0, port: 0, line: TapeLogLine::Motor, level: true }]
        );
    }

    #[test]
    fn tape_log_keeps_most_recent_changes() {
        let mut alarms = AlarmContext::new();
        let mut lines = TapeLines::default();
        let mut tlog = TapeLog::default();
        let toggles = TAPE_LOG_CAPACITY + 10;
        {
            let mut ctx = TapeContext { alarms: &mut alarms, lines: &mut lines };
            for i in 0..toggles {
                tlog.toggle_write_bit(0, i % 2 == 0, &mut ctx);
            }
        }
        assert_eq!(tlog.entries().len(), TAPE_LOG_CAPACITY);
        // The ten oldest toggles are gone; the first kept one set the line.
        assert_eq!(tlog.entries().front().map(|e| e.level), Some(true));
        assert_eq!(tlog.entries().back().map(|e| e.level), Some(false));
    }
}
