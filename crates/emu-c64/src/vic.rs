//! VIC-II bus glue.
//!
//! Pixel generation lives outside this crate. What the machine needs from
//! the VIC-II here is its place on the bus:
//!
//! - the register file, exposed as HIGH-priority I/O sources mirrored
//!   through $D000-$D3FF (mask $3F on the C64, $7F on the C128);
//! - the 16K video bank chosen by CIA2 port A and the memory fetches
//!   through it, whose last byte is the open-bus value;
//! - the raster position, derived from the clock and the timing table;
//! - light pen latching, immediate or delayed through an alarm.

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::{AlarmContext, AlarmId};

use crate::config::{C64Model, MachineTiming};
use crate::io::{DetachPolicy, IoDevice, IoHandle, IoPriority, IoRouter, IoSource};
use crate::memory::C64Memory;

pub const VIC_SOURCE_NAME: &str = "VIC-II";

/// Light pen IRQ flag in $D019.
const IRQ_LIGHT_PEN: u8 = 0x08;
/// Raster IRQ flag in $D019.
const IRQ_RASTER: u8 = 0x01;

/// Register state shared between the glue and its I/O sources.
pub struct VicRegisters {
    regs: [u8; 0x40],
    /// Highest implemented register: $2E on the C64, $30 on the C128.
    last_reg: u8,
    timing: MachineTiming,
    /// Clock at the last bus sync, for the raster counter.
    now: u64,
    raster_compare: u16,
    irq_status: u8,
    irq_enable: u8,
    sprite_sprite_collision: u8,
    sprite_bg_collision: u8,
}

impl VicRegisters {
    fn new(model: C64Model, timing: MachineTiming) -> Self {
        Self {
            regs: [0; 0x40],
            last_reg: match model {
                C64Model::C64 => 0x2E,
                C64Model::C128 => 0x30,
            },
            timing,
            now: 0,
            raster_compare: 0,
            irq_status: 0,
            irq_enable: 0,
            sprite_sprite_collision: 0,
            sprite_bg_collision: 0,
        }
    }

    fn reset(&mut self) {
        self.regs = [0; 0x40];
        self.raster_compare = 0;
        self.irq_status = 0;
        self.irq_enable = 0;
        self.sprite_sprite_collision = 0;
        self.sprite_bg_collision = 0;
    }

    #[must_use]
    pub fn raster_line(&self) -> u16 {
        ((self.now / self.timing.cycles_per_line) % self.timing.lines_per_frame) as u16
    }

    pub fn read(&mut self, reg: u8) -> u8 {
        match reg {
            0x1E => {
                let val = self.sprite_sprite_collision;
                self.sprite_sprite_collision = 0;
                val
            }
            0x1F => {
                let val = self.sprite_bg_collision;
                self.sprite_bg_collision = 0;
                val
            }
            _ => self.peek(reg),
        }
    }

    #[must_use]
    pub fn peek(&self, reg: u8) -> u8 {
        match reg {
            0x11 => {
                let raster_hi = if self.raster_line() & 0x100 != 0 { 0x80 } else { 0 };
                (self.regs[0x11] & 0x7F) | raster_hi
            }
            0x12 => (self.raster_line() & 0xFF) as u8,
            0x16 => self.regs[0x16] | 0xC0,
            0x18 => self.regs[0x18] | 0x01,
            0x19 => {
                let any = if self.irq_status & self.irq_enable & 0x0F != 0 { 0x80 } else { 0 };
                self.irq_status | any | 0x70
            }
            0x1A => self.irq_enable | 0xF0,
            0x1E => self.sprite_sprite_collision,
            0x1F => self.sprite_bg_collision,
            0x20..=0x2E => self.regs[reg as usize] | 0xF0,
            // C128 keyboard lines and 2 MHz bit.
            0x2F if self.last_reg >= 0x2F => self.regs[0x2F] | 0xF8,
            0x30 if self.last_reg >= 0x30 => self.regs[0x30] | 0xFC,
            r if r <= self.last_reg => self.regs[r as usize],
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        if reg > self.last_reg {
            return;
        }
        self.regs[reg as usize] = value;
        match reg {
            0x11 => {
                self.raster_compare =
                    (self.raster_compare & 0x00FF) | (u16::from(value & 0x80) << 1);
            }
            0x12 => {
                self.raster_compare = (self.raster_compare & 0x0100) | u16::from(value);
            }
            // Writing 1 acknowledges.
            0x19 => self.irq_status &= !value & 0x0F,
            0x1A => self.irq_enable = value & 0x0F,
            _ => {}
        }
    }

    #[must_use]
    pub fn raster_compare(&self) -> u16 {
        self.raster_compare
    }

    #[must_use]
    pub fn irq_active(&self) -> bool {
        self.irq_status & self.irq_enable & 0x0F != 0
    }
}

struct VicIo {
    regs: Rc<RefCell<VicRegisters>>,
}

impl IoDevice for VicIo {
    fn read(&mut self, addr: u16) -> Option<u8> {
        Some(self.regs.borrow_mut().read(addr as u8))
    }

    fn peek(&self, addr: u16) -> Option<u8> {
        Some(self.regs.borrow().peek(addr as u8))
    }

    fn store(&mut self, addr: u16, value: u8) {
        self.regs.borrow_mut().write(addr as u8, value);
    }

    fn dump(&self) -> Option<String> {
        let r = self.regs.borrow();
        Some(format!(
            "raster ${:03X} compare ${:03X} irq ${:02X}/${:02X}",
            r.raster_line(),
            r.raster_compare,
            r.irq_status,
            r.irq_enable
        ))
    }
}

/// The VIC-II as seen from the bus.
pub struct VicGlue {
    regs: Rc<RefCell<VicRegisters>>,
    mask: u16,
    handles: Vec<IoHandle>,
    /// 16K bank, 0-3.
    video_bank: u8,
    phi1: u8,
    light_pen_alarm: AlarmId,
    /// Frame in which the light pen last latched.
    light_pen_frame: Option<u64>,
}

impl VicGlue {
    pub fn new(model: C64Model, timing: MachineTiming, alarms: &mut AlarmContext) -> Self {
        Self {
            regs: Rc::new(RefCell::new(VicRegisters::new(model, timing))),
            mask: match model {
                C64Model::C64 => 0x3F,
                C64Model::C128 => 0x7F,
            },
            handles: Vec::new(),
            video_bank: 0,
            phi1: 0xFF,
            light_pen_alarm: alarms.new_alarm("VicLightPen"),
            light_pen_frame: None,
        }
    }

    /// Register the register file over `ranges`. Returns false if the
    /// router is full; sources already registered stay.
    pub fn register(&mut self, io: &mut IoRouter, ranges: &[(u16, u16)]) -> bool {
        for &(start, end) in ranges {
            let source = IoSource {
                name: VIC_SOURCE_NAME,
                start,
                end,
                mask: self.mask,
                priority: IoPriority::High,
                detach: DetachPolicy::Never,
                device: Box::new(VicIo {
                    regs: Rc::clone(&self.regs),
                }),
            };
            match io.register(source) {
                Some(h) => self.handles.push(h),
                None => {
                    log::error!("cannot register VIC-II at ${start:04X}-${end:04X}");
                    return false;
                }
            }
        }
        true
    }

    pub fn unregister(&mut self, io: &mut IoRouter) {
        for h in self.handles.drain(..) {
            io.unregister(h);
        }
    }

    /// Address ranges currently registered.
    #[must_use]
    pub fn handles(&self) -> &[IoHandle] {
        &self.handles
    }

    pub fn set_timing(&mut self, timing: MachineTiming) {
        self.regs.borrow_mut().timing = timing;
    }

    /// Bring the raster counter up to `now` before a register access.
    pub fn sync(&self, now: u64) {
        self.regs.borrow_mut().now = now;
    }

    /// Raster line and cycle within the line at `clk`.
    #[must_use]
    pub fn line_cycle(&self, clk: u64) -> (u16, u16) {
        let t = self.regs.borrow().timing;
        let line = (clk / t.cycles_per_line) % t.lines_per_frame;
        let cycle = clk % t.cycles_per_line;
        (line as u16, cycle as u16)
    }

    /// CIA2 port A bits 0-1 select the bank, inverted.
    pub fn set_video_bank(&mut self, cia2_pa: u8) {
        self.video_bank = !cia2_pa & 3;
    }

    #[must_use]
    pub fn video_bank(&self) -> u8 {
        self.video_bank
    }

    /// VIC-II memory fetch of a 14-bit address in the current bank.
    pub fn fetch(&mut self, memory: &C64Memory, addr14: u16) -> u8 {
        self.phi1 = memory.vic_read(self.video_bank, addr14 & 0x3FFF);
        self.phi1
    }

    /// Last fetched byte, driven onto the bus when no I/O source answers.
    #[must_use]
    pub fn phi1(&self) -> u8 {
        self.phi1
    }

    pub fn registers(&self) -> std::cell::Ref<'_, VicRegisters> {
        self.regs.borrow()
    }

    #[must_use]
    pub fn irq_active(&self) -> bool {
        self.regs.borrow().irq_active()
    }

    /// Latch the beam position at `clk` into $13/$14. Only the first
    /// trigger of each frame latches.
    pub fn trigger_light_pen(&mut self, clk: u64) {
        let frame = {
            let r = self.regs.borrow();
            clk / r.timing.cycles_per_frame
        };
        if self.light_pen_frame == Some(frame) {
            return;
        }
        self.light_pen_frame = Some(frame);

        let (line, cycle) = self.line_cycle(clk);
        let mut r = self.regs.borrow_mut();
        r.regs[0x13] = (u32::from(cycle) * 4) as u8;
        r.regs[0x14] = (line & 0xFF) as u8;
        r.irq_status |= IRQ_LIGHT_PEN;
        log::trace!("light pen latched at line {line} cycle {cycle}");
    }

    /// Arm a light pen trigger at absolute cycle `at`.
    pub fn schedule_light_pen(&self, alarms: &mut AlarmContext, at: u64) {
        alarms.set(self.light_pen_alarm, at);
    }

    #[must_use]
    pub fn light_pen_alarm(&self) -> AlarmId {
        self.light_pen_alarm
    }

    /// The light pen alarm fired `offset` cycles late.
    pub fn handle_light_pen_alarm(&mut self, now: u64, offset: u64) {
        self.trigger_light_pen(now.saturating_sub(offset));
    }

    /// Signal a raster compare match, for the external renderer.
    pub fn raise_raster_irq(&mut self) {
        self.regs.borrow_mut().irq_status |= IRQ_RASTER;
    }

    pub fn reset(&mut self, alarms: &mut AlarmContext) {
        self.regs.borrow_mut().reset();
        alarms.unset(self.light_pen_alarm);
        self.light_pen_frame = None;
        self.video_bank = 0;
        self.phi1 = 0xFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingStandard;
    use crate::memhack::{MemHack, VIC_DEFAULT_RANGES};

    fn make_vic(model: C64Model) -> (VicGlue, IoRouter, AlarmContext) {
        let mut alarms = AlarmContext::new();
        let mut io = IoRouter::new();
        let mut vic = VicGlue::new(model, TimingStandard::Pal.timing(), &mut alarms);
        assert!(vic.register(&mut io, &VIC_DEFAULT_RANGES));
        (vic, io, alarms)
    }

    #[test]
    fn registers_mirror_every_64_bytes() {
        let (_vic, mut io, _) = make_vic(C64Model::C64);
        io.store(0xD020, 0x05);
        assert_eq!(io.read(0xD020), 0xF5);
        assert_eq!(io.read(0xD060), 0xF5);
        assert_eq!(io.read(0xD3E0), 0xF5);
    }

    #[test]
    fn unused_registers_read_ff() {
        let (_vic, mut io, _) = make_vic(C64Model::C64);
        for addr in 0xD02F..=0xD03F {
            assert_eq!(io.read(addr), 0xFF);
        }
    }

    #[test]
    fn c128_has_two_extra_registers() {
        let (_vic, mut io, _) = make_vic(C64Model::C128);
        io.store(0xD030, 0x01);
        assert_eq!(io.read(0xD030), 0xFD);
        assert_eq!(io.read(0xD040), 0xFF);
    }

    #[test]
    fn raster_counter_follows_clock() {
        let (vic, mut io, _) = make_vic(C64Model::C64);
        vic.sync(63 * 300 + 5);
        assert_eq!(io.read(0xD012), (300 & 0xFF) as u8);
        assert_eq!(io.read(0xD011) & 0x80, 0x80);
        assert_eq!(vic.line_cycle(63 * 300 + 5), (300, 5));
    }

    #[test]
    fn light_pen_latches_once_per_frame() {
        let (mut vic, mut io, _) = make_vic(C64Model::C64);
        vic.trigger_light_pen(63 * 100 + 10);
        assert_eq!(io.read(0xD013), 40);
        assert_eq!(io.read(0xD014), 100);
        assert_eq!(io.read(0xD019) & IRQ_LIGHT_PEN, IRQ_LIGHT_PEN);

        vic.trigger_light_pen(63 * 200);
        assert_eq!(io.read(0xD014), 100);

        let next_frame = 63 * 312 + 63 * 50;
        vic.trigger_light_pen(next_frame);
        assert_eq!(io.read(0xD014), 50);
    }

    #[test]
    fn delayed_light_pen_uses_alarm_target() {
        let (mut vic, _io, mut alarms) = make_vic(C64Model::C64);
        vic.schedule_light_pen(&mut alarms, 63 * 20);
        assert_eq!(alarms.pending(vic.light_pen_alarm()), Some(63 * 20));
        vic.handle_light_pen_alarm(63 * 20 + 3, 3);
        assert_eq!(vic.registers().peek(0x14), 20);
    }

    #[test]
    fn bank_from_cia2_port_a() {
        let (mut vic, _io, _) = make_vic(C64Model::C64);
        vic.set_video_bank(0x03);
        assert_eq!(vic.video_bank(), 0);
        vic.set_video_bank(0x00);
        assert_eq!(vic.video_bank(), 3);
    }

    #[test]
    fn fetch_sets_open_bus_value() {
        let (mut vic, _io, _) = make_vic(C64Model::C64);
        let mut mem = C64Memory::new(&[0; 8192], &[0; 8192], &[0xCC; 4096], MemHack::default());
        mem.base_ram_mut()[0xC123] = 0x5A;
        vic.set_video_bank(0x00);
        assert_eq!(vic.fetch(&mem, 0x0123), 0x5A);
        assert_eq!(vic.phi1(), 0x5A);
    }
}
