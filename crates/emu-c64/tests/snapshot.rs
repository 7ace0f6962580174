use emu_c64::datasette::MOTOR_DELAY;
use emu_c64::{C64Error, Machine, MachineConfig, MemHackKind, ResourceValue};
use emu_core::{Snapshot, SnapshotError, SnapshotVersion};
use pretty_assertions::assert_eq;

fn make_machine() -> Machine {
    Machine::new(MachineConfig::default()).expect("machine")
}

/// Save, serialise and load into a fresh machine.
fn round_trip(m: &Machine) -> Machine {
    let bytes = m.save_snapshot().expect("save").into_bytes();
    let snap = Snapshot::from_bytes(bytes).expect("parse");
    let mut fresh = make_machine();
    fresh.load_snapshot(&snap).expect("load");
    fresh
}

#[test]
fn machine_state_survives_round_trip() {
    let mut m = make_machine();
    m.set_resource("DatasetteSpeedTuning", 2000).expect("tuning");
    m.cpu_write(0xC000, 0x5A);
    m.cpu_write(0xD800, 0x07);
    m.cpu_write(0xDD02, 0x03);
    m.cpu_write(0xDD00, 0x01);
    m.cpu_write(0x0001, 0x17);
    m.advance(1000);

    let r = round_trip(&m);
    assert_eq!(r.clock(), 1000);
    assert_eq!(r.peek(0xC000), 0x5A);
    assert_eq!(r.memory().colour_ram()[0], 0x07);
    assert_eq!(r.memory().port_registers(), (0x2F, 0x17));
    assert_eq!(r.vic().video_bank(), 2);
    assert!(r.datasette().motor(0));
    assert_eq!(r.alarms().pending(r.datasette().alarm(0)), Some(MOTOR_DELAY));
    assert_eq!(r.resource("DatasetteSpeedTuning"), Ok(ResourceValue::Int(2000)));
}

#[test]
fn expansion_bank_survives_round_trip() {
    let mut m = make_machine();
    m.set_resource("MemoryHack", 2).expect("+60K");
    m.cpu_write(0xD040, 0x80);
    m.cpu_write(0x2000, 0x11);

    let mut r = round_trip(&m);
    assert_eq!(r.memhack().kind(), MemHackKind::Plus60K);
    assert_eq!(r.cpu_read(0x2000), 0x11);
    r.cpu_write(0xD040, 0x00);
    assert_eq!(r.cpu_read(0x2000), 0x00);
}

#[test]
fn restored_expansion_keeps_its_own_base() {
    let mut m = make_machine();
    m.set_resource("C64_256Kbase", 0xDE00).expect("base");
    m.set_resource("MemoryHack", 1).expect("256K");
    m.cpu_write(0xDE00, 0x01);

    let r = round_trip(&m);
    let names = |addr| -> Vec<&'static str> {
        r.io().sources_at(addr).iter().map(|s| s.name).collect()
    };
    assert_eq!(names(0xDE00), vec!["C64 256K"]);
    assert!(names(0xDF80).is_empty());
    assert_eq!(r.resource("C64_256Kbase"), Ok(ResourceValue::Int(0xDE00)));
    assert_eq!(r.memhack().active().map(|e| e.latch()), Some(0x01));
}

#[test]
fn newer_machine_module_is_rejected() {
    let mut snap = Snapshot::new();
    snap.module_writer("MACHINE", SnapshotVersion::new(2, 0))
        .expect("module")
        .write_u64(0);

    let mut m = make_machine();
    m.advance(10);
    let err = m.load_snapshot(&snap).expect_err("too new");
    assert!(matches!(
        err,
        C64Error::Snapshot(SnapshotError::VersionTooNew { .. })
    ));
    assert_eq!(m.clock(), 10);
}

#[test]
fn missing_module_is_reported() {
    let mut m = make_machine();
    let err = m.load_snapshot(&Snapshot::new()).expect_err("empty");
    assert!(matches!(
        err,
        C64Error::Snapshot(SnapshotError::ModuleNotFound(_))
    ));
}
