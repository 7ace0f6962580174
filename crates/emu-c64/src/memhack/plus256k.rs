//! +256K: four 64K banks above $1000, with separate CPU and VIC selects.

use std::cell::Cell;
use std::rc::Rc;

use emu_core::{Snapshot, SnapshotError, SnapshotVersion};

use super::{latch_source, read_ram_block};
use crate::io::IoSource;

pub const PLUS256K_BASE: u16 = 0xD100;

pub(super) const VIC_RANGES: [(u16, u16); 3] =
    [(0xD000, 0xD0FF), (0xD200, 0xD2FF), (0xD300, 0xD3FF)];

const SIZE: usize = 0x40000;
const LOW_END: u16 = 0x1000;

const SNAPSHOT_NAME: &str = "PLUS256K";
const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(0, 0);

pub struct Plus256K {
    latch: Rc<Cell<u8>>,
    ram: Vec<u8>,
}

impl Plus256K {
    pub(super) fn new() -> Self {
        Self {
            latch: Rc::new(Cell::new(0)),
            ram: vec![0; SIZE],
        }
    }

    #[must_use]
    pub fn latch(&self) -> u8 {
        self.latch.get()
    }

    pub(super) fn reset_latch(&mut self) {
        self.latch.set(0);
    }

    pub(super) fn image(&self) -> &[u8] {
        &self.ram
    }

    pub(super) fn image_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    pub(super) fn io_source(&self) -> IoSource {
        latch_source("+256K", PLUS256K_BASE, 0xD1FF, &self.latch, 0, 0xFF)
    }

    #[must_use]
    pub fn cpu_bank(&self) -> usize {
        usize::from(self.latch.get() & 3)
    }

    #[must_use]
    pub fn vic_bank(&self) -> usize {
        usize::from(self.latch.get() >> 6)
    }

    fn offset(bank: usize, addr: u16) -> usize {
        if addr < LOW_END {
            usize::from(addr)
        } else {
            (bank << 16) | usize::from(addr)
        }
    }

    pub(super) fn read(&self, addr: u16) -> u8 {
        self.ram[Self::offset(self.cpu_bank(), addr)]
    }

    pub(super) fn write(&mut self, addr: u16, value: u8) {
        let offset = Self::offset(self.cpu_bank(), addr);
        self.ram[offset] = value;
    }

    pub(super) fn vic_read(&self, addr: u16) -> u8 {
        self.ram[Self::offset(self.vic_bank(), addr)]
    }

    pub(super) fn write_snapshot(&self, snap: &mut Snapshot) -> Result<(), SnapshotError> {
        snap.module_writer(SNAPSHOT_NAME, SNAPSHOT_VERSION)?
            .write_u8(self.latch.get())
            .write_block(&self.ram);
        Ok(())
    }

    pub(super) fn read_snapshot(&mut self, snap: &Snapshot) -> Result<(), SnapshotError> {
        let mut m = snap.module(SNAPSHOT_NAME)?;
        m.check_version(SNAPSHOT_VERSION)?;
        let latch = m.read_u8()?;
        read_ram_block(&mut m, &mut self.ram)?;
        self.latch.set(latch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_4k_is_shared_by_all_banks() {
        let mut p = Plus256K::new();
        p.write(0x0800, 0x42);
        p.latch.set(0x03);
        assert_eq!(p.read(0x0800), 0x42);
        p.write(0x2000, 0x99);
        assert_eq!(p.ram[0x3_2000], 0x99);
        p.latch.set(0x00);
        assert_eq!(p.read(0x2000), 0);
    }

    #[test]
    fn vic_bank_is_independent() {
        let mut p = Plus256K::new();
        p.latch.set(0x01);
        p.write(0x4000, 0x77);
        p.latch.set(0x41);
        assert_eq!(p.read(0x4000), 0x77);
        assert_eq!(p.vic_read(0x4000), 0x77);
        p.latch.set(0x01);
        assert_eq!(p.vic_read(0x4000), 0);
        // Unused bits read back.
        p.latch.set(0x3C);
        assert_eq!(p.latch(), 0x3C);
    }
}
