//! +60K: a second 64K bank for $1000-$FFFF, switched by latch bit 7.

use std::cell::Cell;
use std::rc::Rc;

use emu_core::{Snapshot, SnapshotError, SnapshotVersion};

use super::{latch_source, read_ram_block};
use crate::io::IoSource;

pub const PLUS60K_BASES: [u16; 2] = [0xD040, 0xD100];
pub const PLUS60K_DEFAULT_BASE: u16 = 0xD040;

const BANK_SELECT: u8 = 0x80;
const LOW_END: u16 = 0x1000;

const SNAPSHOT_NAME: &str = "PLUS60K";
const SNAPSHOT_VERSION: SnapshotVersion = SnapshotVersion::new(0, 0);

pub struct Plus60K {
    base: u16,
    latch: Rc<Cell<u8>>,
    /// Second bank, indexed by CPU address. $0000-$0FFF is never used.
    ram: Vec<u8>,
}

impl Plus60K {
    pub(super) fn new(base: u16) -> Self {
        Self {
            base,
            latch: Rc::new(Cell::new(0)),
            ram: vec![0; 0x10000],
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
        self.latch.set(0);
    }

    pub(super) fn image(&self) -> &[u8] {
        &self.ram[usize::from(LOW_END)..]
    }

    pub(super) fn image_mut(&mut self) -> &mut [u8] {
        &mut self.ram[usize::from(LOW_END)..]
    }

    fn window_end(&self) -> u16 {
        if self.base == 0xD040 { 0xD07F } else { 0xD1FF }
    }

    pub(super) fn io_source(&self) -> IoSource {
        latch_source("+60K", self.base, self.window_end(), &self.latch, 0x7F, BANK_SELECT)
    }

    /// The VIC-II keeps whatever part of $D000-$D3FF the window leaves.
    pub(super) fn vic_ranges(&self) -> Vec<(u16, u16)> {
        if self.base == 0xD040 {
            vec![
                (0xD000, 0xD03F),
                (0xD080, 0xD0FF),
                (0xD100, 0xD1FF),
                (0xD200, 0xD2FF),
                (0xD300, 0xD3FF),
            ]
        } else {
            vec![(0xD000, 0xD0FF), (0xD200, 0xD2FF), (0xD300, 0xD3FF)]
        }
    }

    fn second_bank(&self, addr: u16) -> bool {
        addr >= LOW_END && self.latch.get() & BANK_SELECT != 0
    }

    /// `None` when the access falls through to base RAM.
    pub(super) fn read(&self, _ram: &[u8; 0x10000], addr: u16) -> Option<u8> {
        self.second_bank(addr).then(|| self.ram[usize::from(addr)])
    }

    pub(super) fn write(&mut self, addr: u16, value: u8) -> bool {
        if self.second_bank(addr) {
            self.ram[usize::from(addr)] = value;
            true
        } else {
            false
        }
    }

    pub(super) fn write_snapshot(&self, snap: &mut Snapshot) -> Result<(), SnapshotError> {
        snap.module_writer(SNAPSHOT_NAME, SNAPSHOT_VERSION)?
            .write_u16(self.base)
            .write_u8(self.latch.get())
            .write_block(self.image());
        Ok(())
    }

    pub(super) fn read_snapshot(&mut self, snap: &Snapshot) -> Result<(), SnapshotError> {
        let mut m = snap.module(SNAPSHOT_NAME)?;
        m.check_version(SNAPSHOT_VERSION)?;
        let base = m.read_u16()?;
        if !PLUS60K_BASES.contains(&base) {
            return Err(m.invalid(format!("base ${base:04X}")));
        }
        let latch = m.read_u8()?;
        read_ram_block(&mut m, self.image_mut())?;
        self.base = base;
        self.latch.set(latch & BANK_SELECT);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_7_switches_upper_memory_only() {
        let mut p = Plus60K::new(PLUS60K_DEFAULT_BASE);
        let ram = [0x11u8; 0x10000];
        assert!(!p.write(0x2000, 0x55));
        p.latch.set(0x80);
        assert!(p.write(0x2000, 0x55));
        assert!(!p.write(0x0FFF, 0x55));
        assert_eq!(p.read(&ram, 0x2000), Some(0x55));
        assert_eq!(p.read(&ram, 0x0800), None);
    }

    #[test]
    fn window_depends_on_base() {
        let low = Plus60K::new(0xD040);
        assert_eq!(low.io_source().end, 0xD07F);
        let high = Plus60K::new(0xD100);
        assert_eq!(high.io_source().end, 0xD1FF);
        assert!(!high.vic_ranges().iter().any(|&(s, _)| s == 0xD100));
    }

    #[test]
    fn image_is_60k() {
        let p = Plus60K::new(PLUS60K_DEFAULT_BASE);
        assert_eq!(p.image().len(), 61_440);
    }
}
