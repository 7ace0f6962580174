//! CIA 6526 register stubs.
//!
//! Two CIAs in the C64:
//! - CIA1 ($DC00-$DCFF): cassette read line on FLAG
//! - CIA2 ($DD00-$DDFF): VIC-II bank on port A bits 0-1
//!
//! Only the port and interrupt registers behave. Timers and TOD are plain
//! storage; the host's CIA core takes over when one is attached.
//!
//! | Reg | Read                 | Write                  |
//! |-----|----------------------|------------------------|
//! | $x0 | Port A pins          | Port A data            |
//! | $x1 | Port B pins          | Port B data            |
//! | $x2 | Port A DDR           | Port A DDR             |
//! | $x3 | Port B DDR           | Port B DDR             |
//! | $xD | ICR (read clears)    | ICR mask (bit 7 set/clear) |

use std::cell::RefCell;
use std::rc::Rc;

use crate::io::{DetachPolicy, IoDevice, IoPriority, IoSource};

/// ICR bit raised by a falling edge on FLAG.
pub const ICR_FLAG: u8 = 0x10;

pub struct Cia {
    name: &'static str,
    port_a: u8,
    port_b: u8,
    ddr_a: u8,
    ddr_b: u8,
    /// Timer, TOD, SDR and control registers, stored only.
    regs: [u8; 16],
    icr_status: u8,
    icr_mask: u8,
}

impl Cia {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            port_a: 0xFF,
            port_b: 0xFF,
            ddr_a: 0,
            ddr_b: 0,
            regs: [0; 16],
            icr_status: 0,
            icr_mask: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.name);
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Port A as seen on the pins: inputs float high.
    #[must_use]
    pub fn port_a_output(&self) -> u8 {
        self.port_a | !self.ddr_a
    }

    /// Port A data and direction registers.
    #[must_use]
    pub fn port_a_registers(&self) -> (u8, u8) {
        (self.port_a, self.ddr_a)
    }

    #[must_use]
    pub fn port_b_output(&self) -> u8 {
        self.port_b | !self.ddr_b
    }

    /// Falling edge on FLAG, from the cassette read line.
    pub fn trigger_flag(&mut self) {
        self.icr_status |= ICR_FLAG;
    }

    #[must_use]
    pub fn irq_active(&self) -> bool {
        self.icr_status & self.icr_mask & 0x1F != 0
    }

    #[must_use]
    pub fn icr_status(&self) -> u8 {
        self.icr_status
    }

    #[must_use]
    pub fn peek(&self, reg: u8) -> u8 {
        match reg & 0x0F {
            0x0 => self.port_a_output(),
            0x1 => self.port_b_output(),
            0x2 => self.ddr_a,
            0x3 => self.ddr_b,
            0xD => {
                let irq = if self.irq_active() { 0x80 } else { 0 };
                self.icr_status | irq
            }
            r => self.regs[r as usize],
        }
    }

    pub fn read(&mut self, reg: u8) -> u8 {
        let value = self.peek(reg);
        if reg & 0x0F == 0x0D {
            self.icr_status = 0;
        }
        value
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        match reg & 0x0F {
            0x0 => self.port_a = value,
            0x1 => self.port_b = value,
            0x2 => self.ddr_a = value,
            0x3 => self.ddr_b = value,
            0xD => {
                if value & 0x80 != 0 {
                    self.icr_mask |= value & 0x1F;
                } else {
                    self.icr_mask &= !(value & 0x1F);
                }
            }
            r => self.regs[r as usize] = value,
        }
    }

    /// The chip mirrored through one I/O page.
    pub fn io_source(cia: &Rc<RefCell<Cia>>, start: u16) -> IoSource {
        IoSource {
            name: cia.borrow().name,
            start,
            end: start | 0x00FF,
            mask: 0x0F,
            priority: IoPriority::High,
            detach: DetachPolicy::Never,
            device: Box::new(CiaIo(Rc::clone(cia))),
        }
    }
}

struct CiaIo(Rc<RefCell<Cia>>);

impl IoDevice for CiaIo {
    fn read(&mut self, addr: u16) -> Option<u8> {
        Some(self.0.borrow_mut().read(addr as u8))
    }

    fn peek(&self, addr: u16) -> Option<u8> {
        Some(self.0.borrow().peek(addr as u8))
    }

    fn store(&mut self, addr: u16, value: u8) {
        self.0.borrow_mut().write(addr as u8, value);
    }

    fn dump(&self) -> Option<String> {
        let c = self.0.borrow();
        Some(format!(
            "PRA ${:02X} DDRA ${:02X} PRB ${:02X} DDRB ${:02X} ICR ${:02X}/${:02X}",
            c.port_a, c.ddr_a, c.port_b, c.ddr_b, c.icr_status, c.icr_mask
        ))
    }
}
