//! C128 VDC (8563) register interface.
//!
//! $D600 selects an internal register, $D601 accesses it. Both mirror
//! through $D600-$D7FF on address bit 0. Register 31 is the data port into
//! the VDC's own 64K of RAM, auto-incrementing the update address in
//! R18/R19; writing the word count in R30 runs a block fill or copy.

use std::cell::RefCell;
use std::rc::Rc;

use crate::io::{DetachPolicy, IoDevice, IoPriority, IoSource};

const REG_COUNT: usize = 38;

/// Bits forced to 1 when reading each register back.
const REG_UNUSED_BITS: [u8; REG_COUNT] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0xE0, 0x00, 0x00, //
    0xFC, 0xE0, 0x80, 0xE0, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xE0, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0xE0, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0xF0, 0x3F,
];

const STATUS_READY: u8 = 0x80;
const STATUS_LIGHT_PEN: u8 = 0x40;
const REVISION: u8 = 2;

const R_UPDATE_HI: usize = 18;
const R_UPDATE_LO: usize = 19;
const R_COPY: usize = 24;
const R_WORD_COUNT: usize = 30;
const R_DATA: usize = 31;
const R_BLOCK_HI: usize = 32;
const R_BLOCK_LO: usize = 33;

pub struct Vdc {
    regs: [u8; REG_COUNT],
    update_reg: u8,
    ram: Vec<u8>,
    light_pen_triggered: bool,
}

impl Vdc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: [0; REG_COUNT],
            update_reg: 0,
            ram: vec![0; 0x10000],
            light_pen_triggered: false,
        }
    }

    pub fn reset(&mut self) {
        self.regs = [0; REG_COUNT];
        self.update_reg = 0;
        self.light_pen_triggered = false;
    }

    fn update_addr(&self) -> u16 {
        u16::from_be_bytes([self.regs[R_UPDATE_HI], self.regs[R_UPDATE_LO]])
    }

    fn set_update_addr(&mut self, addr: u16) {
        [self.regs[R_UPDATE_HI], self.regs[R_UPDATE_LO]] = addr.to_be_bytes();
    }

    fn write_data(&mut self) {
        let addr = self.update_addr();
        self.ram[usize::from(addr)] = self.regs[R_DATA];
        self.set_update_addr(addr.wrapping_add(1));
    }

    fn fill_or_copy(&mut self) {
        let len = match self.regs[R_WORD_COUNT] {
            0 => 256,
            n => u16::from(n),
        };
        let dst = self.update_addr();
        if self.regs[R_COPY] & 0x80 != 0 {
            let src = u16::from_be_bytes([self.regs[R_BLOCK_HI], self.regs[R_BLOCK_LO]]);
            for i in 0..len {
                self.ram[usize::from(dst.wrapping_add(i))] =
                    self.ram[usize::from(src.wrapping_add(i))];
            }
            let src_end = src.wrapping_add(len);
            self.regs[R_DATA] = self.ram[usize::from(src_end.wrapping_sub(1))];
            [self.regs[R_BLOCK_HI], self.regs[R_BLOCK_LO]] = src_end.to_be_bytes();
        } else {
            let fill = self.regs[R_DATA];
            for i in 0..len {
                self.ram[usize::from(dst.wrapping_add(i))] = fill;
            }
        }
        self.set_update_addr(dst.wrapping_add(len));
    }

    pub fn store(&mut self, addr: u16, value: u8) {
        if addr & 1 == 0 {
            self.update_reg = value & 0x3F;
            return;
        }
        let reg = usize::from(self.update_reg);
        if reg >= REG_COUNT {
            return;
        }
        self.regs[reg] = value;
        match reg {
            R_WORD_COUNT => self.fill_or_copy(),
            R_DATA => self.write_data(),
            _ => {}
        }
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        if addr & 1 == 1 {
            match usize::from(self.update_reg) {
                R_DATA => {
                    let a = self.update_addr();
                    self.set_update_addr(a.wrapping_add(1));
                    return self.ram[usize::from(a)];
                }
                16 | 17 => self.light_pen_triggered = false,
                _ => {}
            }
        }
        self.peek(addr)
    }

    #[must_use]
    pub fn peek(&self, addr: u16) -> u8 {
        if addr & 1 == 0 {
            let lp = if self.light_pen_triggered { STATUS_LIGHT_PEN } else { 0 };
            return STATUS_READY | REVISION | lp;
        }
        match usize::from(self.update_reg) {
            R_DATA => self.ram[usize::from(self.update_addr())],
            // 64K fitted.
            28 => self.regs[28] | 0x1F,
            r if r < REG_COUNT => self.regs[r] | REG_UNUSED_BITS[r],
            _ => 0xFF,
        }
    }

    pub fn trigger_light_pen(&mut self) {
        self.light_pen_triggered = true;
    }

    #[must_use]
    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    /// $D600-$D7FF, never detached.
    pub fn io_source(vdc: &Rc<RefCell<Vdc>>) -> IoSource {
        IoSource {
            name: "VDC",
            start: 0xD600,
            end: 0xD7FF,
            mask: 0x01,
            priority: IoPriority::Normal,
            detach: DetachPolicy::Never,
            device: Box::new(VdcIo(Rc::clone(vdc))),
        }
    }
}

impl Default for Vdc {
    fn default() -> Self {
        Self::new()
    }
}

struct VdcIo(Rc<RefCell<Vdc>>);

impl IoDevice for VdcIo {
    fn read(&mut self, addr: u16) -> Option<u8> {
        Some(self.0.borrow_mut().read(addr))
    }

    fn peek(&self, addr: u16) -> Option<u8> {
        Some(self.0.borrow().peek(addr))
    }

    fn store(&mut self, addr: u16, value: u8) {
        self.0.borrow_mut().store(addr, value);
    }

    fn dump(&self) -> Option<String> {
        let v = self.0.borrow();
        Some(format!(
            "reg {:02} update ${:04X}",
            v.update_reg,
            v.update_addr()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(vdc: &mut Vdc, reg: u8, value: u8) {
        vdc.store(0, reg);
        vdc.store(1, value);
    }

    #[test]
    fn status_is_always_ready() {
        let vdc = Vdc::new();
        assert_eq!(vdc.peek(0) & STATUS_READY, STATUS_READY);
    }

    #[test]
    fn data_port_auto_increments() {
        let mut vdc = Vdc::new();
        select(&mut vdc, 18, 0x10);
        select(&mut vdc, 19, 0x00);
        select(&mut vdc, 31, 0xAA);
        vdc.store(1, 0xBB);
        assert_eq!(vdc.ram()[0x1000], 0xAA);
        assert_eq!(vdc.ram()[0x1001], 0xBB);
        assert_eq!(vdc.update_addr(), 0x1002);
    }

    #[test]
    fn block_fill() {
        let mut vdc = Vdc::new();
        select(&mut vdc, 18, 0x20);
        select(&mut vdc, 19, 0x00);
        select(&mut vdc, 31, 0x55);
        select(&mut vdc, 30, 0x10);
        // The data write itself stored one byte, the fill sixteen more.
        assert!(vdc.ram()[0x2001..0x2011].iter().all(|&b| b == 0x55));
        assert_eq!(vdc.update_addr(), 0x2011);
    }

    #[test]
    fn unused_bits_read_as_one() {
        let mut vdc = Vdc::new();
        select(&mut vdc, 5, 0x00);
        assert_eq!(vdc.read(1), 0xE0);
        vdc.store(0, 0x3F);
        assert_eq!(vdc.read(1), 0xFF);
    }
}
