//! Datasette behaviour through the machine: the 6510 port drives the
//! motor and write lines, the datasette answers on sense and CIA1 FLAG.

use std::path::{Path, PathBuf};

use emu_c64::datasette::MOTOR_DELAY;
use emu_c64::memory::PORT_SENSE;
use emu_c64::{DatasetteCommand, DatasetteMode, Machine, MachineConfig};
use format_c64_tap::TapHeader;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// $01 values with the motor on (bit 5 low), write line low and high.
const MOTOR_ON_WRITE_LOW: u8 = 0x17;
const MOTOR_ON_WRITE_HIGH: u8 = 0x1F;
const MOTOR_OFF: u8 = 0x37;

fn make_machine() -> Machine {
    Machine::new(MachineConfig::default()).expect("machine")
}

fn make_tap(dir: &Path, version: u8, data: &[u8]) -> PathBuf {
    let path = dir.join("tape.tap");
    let mut header = TapHeader::new(version);
    header.data_length = data.len() as u32;
    let mut raw = header.to_bytes().to_vec();
    raw.extend_from_slice(data);
    std::fs::write(&path, raw).expect("write tap");
    path
}

fn pending(m: &Machine) -> Option<u64> {
    m.alarms().pending(m.datasette().alarm(0))
}

/// Attach, switch the motor on and press PLAY at the current clock.
fn play(m: &mut Machine, path: &Path) {
    m.attach_tape(0, path, false).expect("attach");
    m.cpu_write(0x0001, MOTOR_ON_WRITE_LOW);
    m.datasette_control(0, DatasetteCommand::Start).expect("play");
}

/// Targets of the first `n` alarms after the motor delay.
fn alarm_deltas(m: &mut Machine, n: usize) -> Vec<u64> {
    let start = m.clock();
    m.advance(MOTOR_DELAY);
    let mut last = start + MOTOR_DELAY;
    let mut deltas = Vec::new();
    for _ in 0..n {
        let next = pending(m).expect("alarm pending");
        deltas.push(next - last);
        m.advance(next - m.clock());
        last = next;
    }
    deltas
}

#[test]
fn short_then_long_gap_plays_back() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    play(&mut m, &make_tap(dir.path(), 1, &[10, 0, 0x64, 0x00, 0x00]));
    assert_eq!(pending(&m), Some(MOTOR_DELAY));

    m.advance(MOTOR_DELAY);
    assert_eq!(pending(&m), Some(MOTOR_DELAY + 80));
    assert_eq!(m.tape_lines().flux_total(0), 1);
    assert_eq!(m.cia1().icr_status() & 0x10, 0x10);

    m.advance(80);
    assert_eq!(pending(&m), Some(MOTOR_DELAY + 180));

    m.advance(100);
    assert_eq!(m.datasette().mode(0), DatasetteMode::Stop);
    assert_eq!(m.cpu_read(0x0001) & PORT_SENSE, PORT_SENSE);
}

#[test]
fn speed_tuning_stretches_gaps() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    m.set_resource("DatasetteSpeedTuning", 50_000).expect("tuning");
    play(&mut m, &make_tap(dir.path(), 1, &[0, 100, 0, 0, 0, 100, 0, 0]));
    assert_eq!(alarm_deltas(&mut m, 1), vec![150]);
}

#[test]
fn zero_byte_in_v0_image_uses_zero_gap_delay() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    play(&mut m, &make_tap(dir.path(), 0, &[0, 10, 10]));
    assert_eq!(alarm_deltas(&mut m, 1), vec![2500]);
}

#[test]
fn zero_gap_delay_resource_applies() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    m.set_resource("DatasetteZeroGapDelay", 4000).expect("delay");
    play(&mut m, &make_tap(dir.path(), 0, &[0, 10, 10]));
    assert_eq!(alarm_deltas(&mut m, 1), vec![4000]);
}

#[test]
fn motor_restarted_within_delay_keeps_running() {
    let mut m = make_machine();
    m.cpu_write(0x0001, MOTOR_ON_WRITE_LOW);
    m.advance(1000);
    m.cpu_write(0x0001, MOTOR_OFF);
    m.advance(1000);
    m.cpu_write(0x0001, MOTOR_ON_WRITE_LOW);
    m.advance(5 * MOTOR_DELAY);
    assert!(m.datasette().motor(0));
}

#[test]
fn motor_stops_after_delay() {
    let mut m = make_machine();
    m.cpu_write(0x0001, MOTOR_ON_WRITE_LOW);
    m.advance(1000);
    m.cpu_write(0x0001, MOTOR_OFF);
    m.advance(MOTOR_DELAY - 1);
    assert!(m.datasette().motor(0));
    m.advance(1);
    assert!(!m.datasette().motor(0));
}

/// Record three pulses through the write line, rising edge to rising edge.
fn record(m: &mut Machine, path: &Path) {
    m.create_tape(0, path).expect("create");
    m.datasette_control(0, DatasetteCommand::Record).expect("record");
    m.advance(1000);
    m.cpu_write(0x0001, MOTOR_ON_WRITE_LOW);
    for (wait, value) in [
        (400, MOTOR_ON_WRITE_HIGH),
        (100, MOTOR_ON_WRITE_LOW),
        (196, MOTOR_ON_WRITE_HIGH),
        (100, MOTOR_ON_WRITE_LOW),
        (2900, MOTOR_ON_WRITE_HIGH),
        (100, MOTOR_ON_WRITE_LOW),
    ] {
        m.advance(wait);
        m.cpu_write(0x0001, value);
    }
    m.datasette_control(0, DatasetteCommand::Stop).expect("stop");
    m.detach_tape(0).expect("detach");
}

#[test]
fn recording_rewrites_header_length() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("rec.tap");
    let mut m = make_machine();
    record(&mut m, &path);

    let raw = std::fs::read(&path).expect("read back");
    assert_eq!(&raw[..12], b"C64-TAPE-RAW");
    assert_eq!(raw[12], 1);
    assert_eq!(&raw[16..20], &[6, 0, 0, 0]);
    assert_eq!(&raw[20..], &[50, 37, 0, 0xB8, 0x0B, 0x00]);
}

#[test]
fn recorded_pulses_play_back() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("rec.tap");
    record(&mut make_machine(), &path);

    let mut m = make_machine();
    play(&mut m, &path);
    let deltas = alarm_deltas(&mut m, 3);
    for (played, recorded) in deltas.iter().zip([400u64, 296]) {
        assert!(played.abs_diff(recorded) <= 7, "{played} vs {recorded}");
    }
    assert_eq!(deltas[2], 3000);
}

#[test]
fn reset_stops_tape_when_resetting_with_cpu() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    play(&mut m, &make_tap(dir.path(), 1, &[10, 10, 10, 10]));
    m.advance(MOTOR_DELAY + 100);
    m.reset(emu_c64::ResetMode::Soft);
    assert_eq!(m.datasette().mode(0), DatasetteMode::Stop);
    assert_eq!(m.datasette().image(0).map(|i| i.position()), Some(0));
}

#[test]
fn reset_leaves_tape_alone_otherwise() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    m.set_resource("DatasetteResetWithCPU", 0).expect("resource");
    play(&mut m, &make_tap(dir.path(), 1, &[10, 10, 10, 10]));
    m.reset(emu_c64::ResetMode::Soft);
    assert_eq!(m.datasette().mode(0), DatasetteMode::Start);
}

#[test]
fn short_tape_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    assert!(m.attach_tape(0, make_tap(dir.path(), 1, &[10, 10]), false).is_err());
    assert!(m.datasette().image(0).is_none());
}

#[test]
fn forward_then_rewind_returns_to_start() {
    let dir = TempDir::new().expect("tempdir");
    let mut m = make_machine();
    let data = vec![0x30u8; 2000];
    m.attach_tape(0, make_tap(dir.path(), 1, &data), false).expect("attach");
    m.cpu_write(0x0001, MOTOR_ON_WRITE_LOW);

    m.datasette_control(0, DatasetteCommand::Forward).expect("ff");
    m.advance(200_000);
    let wound = m.datasette().image(0).expect("tape").counters.cycle_counter;
    assert!(wound > 0);

    m.datasette_control(0, DatasetteCommand::Rewind).expect("rew");
    m.advance(5_000_000);
    let image_counters = m.datasette().image(0).expect("tape").counters;
    assert_eq!(image_counters.cycle_counter, 0);
    assert_eq!(m.datasette().mode(0), DatasetteMode::Stop);
}
