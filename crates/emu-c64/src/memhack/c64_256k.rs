//! C64 256K: four 64K banks, selected per 16K segment.

use std::cell::Cell;
use std::rc::Rc;

use emu_core::{Snapshot, SnapshotError, SnapshotVersion};

use super::{latch_source, read_ram_block};
use crate::io::IoSource;

pub const C64_256K_BASES: [u16; 4] = [0xDE00, 0xDE80, 0xDF00, 0xDF80];
pub const C64_256K_DEFAULT_BASE: u16 = 0xDF80;

const SIZE: usize = 0x40000;
const WINDOW: u16 = 0x80;
/// Segment n maps to bank n.
const POWER_ON_LATCH: u8 = 0xE4;

const SNAPSHOT_NAME: &str = "C64_256K";
const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(0, 1);

pub struct C64Ram256K {
    base: u16,
    latch: Rc<Cell<u8>>,
    io_swap: u8,
    ram: Vec<u8>,
}

impl C64Ram256K {
    pub(super) fn new(base: u16) -> Self {
        Self {
            base,
            latch: Rc::new(Cell::new(POWER_ON_LATCH)),
            io_swap: 0,
            ram: vec![0; SIZE],
        }
    }

    #[must_use]
    pub fn base(&self) -> u16 {
        self.base
    }

    #[must_use]
    pub fn latch(&self) -> u8 {
        self.latch.get()
    }

    pub(super) fn reset_latch(&mut self) {
        self.latch.set(POWER_ON_LATCH);
    }

    pub(super) fn image(&self) -> &[u8] {
        &self.ram
    }

    pub(super) fn image_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    pub(super) fn io_source(&self) -> IoSource {
        latch_source("C64 256K", self.base, self.base + WINDOW - 1, &self.latch, 0, 0xFF)
    }

    /// Bank selected for the 16K segment containing `addr`.
    #[must_use]
    pub fn bank_for(&self, addr: u16) -> usize {
        let segment = addr >> 14;
        usize::from((self.latch.get() >> (segment * 2)) & 3)
    }

    fn offset(&self, addr: u16) -> usize {
        (self.bank_for(addr) << 16) | usize::from(addr)
    }

    pub(super) fn read(&self, addr: u16) -> u8 {
        self.ram[self.offset(addr)]
    }

    pub(super) fn write(&mut self, addr: u16, value: u8) {
        let offset = self.offset(addr);
        self.ram[offset] = value;
    }

    pub(super) fn write_snapshot(&self, snap: &mut Snapshot) -> Result<(), SnapshotError> {
        snap.module_writer(SNAPSHOT_NAME, SNAPSHOT_VERSION)?
            .write_bool(true)
            .write_u16(self.base)
            .write_u8(self.latch.get())
            .write_u8(self.io_swap)
            .write_block(&self.ram);
        Ok(())
    }

    pub(super) fn read_snapshot(&mut self, snap: &Snapshot) -> Result<(), SnapshotError> {
        let mut m = snap.module(SNAPSHOT_NAME)?;
        let version = m.check_version(SNAPSHOT_VERSION)?;
        let _enabled = m.read_bool()?;
        let base = m.read_u16()?;
        if !C64_256K_BASES.contains(&base) {
            return Err(m.invalid(format!("base ${base:04X}")));
        }
        let latch = m.read_u8()?;
        self.io_swap = if version >= SnapshotVersion::new(0, 1) {
            m.read_u8()?
        } else {
            0
        };
        read_ram_block(&mut m, &mut self.ram)?;
        self.base = base;
        self.latch.set(latch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_on_latch_gives_flat_view() {
        let mut ram = C64Ram256K::new(C64_256K_DEFAULT_BASE);
        ram.write(0x0010, 1);
        ram.write(0x4010, 2);
        ram.write(0xC010, 3);
        assert_eq!(ram.bank_for(0x0010), 0);
        assert_eq!(ram.bank_for(0x4010), 1);
        assert_eq!(ram.bank_for(0xC010), 3);
        assert_eq!(ram.ram[0x0010], 1);
        assert_eq!(ram.ram[0x1_4010], 2);
        assert_eq!(ram.ram[0x3_C010], 3);
    }

    #[test]
    fn latch_selects_bank_per_segment() {
        let ram = C64Ram256K::new(C64_256K_DEFAULT_BASE);
        // Segment 0 -> bank 2, others bank 0.
        ram.latch.set(0x02);
        assert_eq!(ram.bank_for(0x3FFF), 2);
        assert_eq!(ram.bank_for(0x4000), 0);
        ram.latch.set(0xC0);
        assert_eq!(ram.bank_for(0xFFFF), 3);
    }

    #[test]
    fn io_window_is_128_bytes() {
        let ram = C64Ram256K::new(0xDE80);
        let src = ram.io_source();
        assert_eq!((src.start, src.end), (0xDE80, 0xDEFF));
    }
}
