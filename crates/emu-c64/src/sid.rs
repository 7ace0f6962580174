//! SID 6581/8580 register file.
//!
//! No synthesis. Writes are stored; the write-only registers read back the
//! last value written to any register, as the real data bus does for a
//! short while.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::C64Model;
use crate::io::{DetachPolicy, IoDevice, IoPriority, IoSource};

pub struct Sid {
    regs: [u8; 0x20],
    last_write: u8,
}

impl Sid {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: [0; 0x20],
            last_write: 0,
        }
    }

    pub fn reset(&mut self) {
        self.regs = [0; 0x20];
        self.last_write = 0;
    }

    #[must_use]
    pub fn read(&self, reg: u8) -> u8 {
        match reg & 0x1F {
            // POTX/POTY with nothing plugged in.
            0x19 | 0x1A => 0xFF,
            // OSC3/ENV3.
            0x1B | 0x1C => 0,
            _ => self.last_write,
        }
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        self.regs[(reg & 0x1F) as usize] = value;
        self.last_write = value;
    }

    /// Value last stored to a register.
    #[must_use]
    pub fn register(&self, reg: u8) -> u8 {
        self.regs[(reg & 0x1F) as usize]
    }

    /// The SID at $D400 plus its LOW-priority mirrors. On the C128 the
    /// mirrors stop at $D4FF.
    pub fn io_sources(sid: &Rc<RefCell<Sid>>, model: C64Model) -> Vec<IoSource> {
        let mirror_end = match model {
            C64Model::C64 => 0xD7FF,
            C64Model::C128 => 0xD4FF,
        };
        vec![
            IoSource {
                name: "SID",
                start: 0xD400,
                end: 0xD41F,
                mask: 0x1F,
                priority: IoPriority::High,
                detach: DetachPolicy::Never,
                device: Box::new(SidIo(Rc::clone(sid))),
            },
            IoSource {
                name: "SID mirrors",
                start: 0xD420,
                end: mirror_end,
                mask: 0x1F,
                priority: IoPriority::Low,
                detach: DetachPolicy::Never,
                device: Box::new(SidIo(Rc::clone(sid))),
            },
        ]
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

struct SidIo(Rc<RefCell<Sid>>);

impl IoDevice for SidIo {
    fn read(&mut self, addr: u16) -> Option<u8> {
        Some(self.0.borrow().read(addr as u8))
    }

    fn peek(&self, addr: u16) -> Option<u8> {
        Some(self.0.borrow().read(addr as u8))
    }

    fn store(&mut self, addr: u16, value: u8) {
        self.0.borrow_mut().write(addr as u8, value);
    }

    fn dump(&self) -> Option<String> {
        let sid = self.0.borrow();
        let regs: Vec<String> = sid.regs.iter().map(|r| format!("{r:02X}")).collect();
        Some(regs.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoRouter;

    fn make_router(model: C64Model) -> (Rc<RefCell<Sid>>, IoRouter) {
        let sid = Rc::new(RefCell::new(Sid::new()));
        let mut io = IoRouter::new();
        for source in Sid::io_sources(&sid, model) {
            io.register(source).expect("register");
        }
        (sid, io)
    }

    #[test]
    fn mirrors_reach_the_same_registers() {
        let (sid, mut io) = make_router(C64Model::C64);
        io.store(0xD438, 0x0F);
        assert_eq!(sid.borrow().register(0x18), 0x0F);
        assert_eq!(io.read(0xD419), 0xFF);
        assert_eq!(io.read(0xD7F9), 0xFF);
    }

    #[test]
    fn write_only_registers_read_last_write() {
        let (_sid, mut io) = make_router(C64Model::C64);
        io.store(0xD400, 0x42);
        assert_eq!(io.read(0xD401), 0x42);
    }

    #[test]
    fn c128_mirrors_end_at_d4ff() {
        let (_sid, io) = make_router(C64Model::C128);
        assert!(!io.sources_at(0xD4FF).is_empty());
        assert!(io.sources_at(0xD500).is_empty());
    }
}
