//! C64 memory subsystem.
//!
//! The C64 has 64K RAM with overlaid ROMs and I/O controlled by the 6510's
//! internal I/O port at $00 (DDR) and $01 (data register).
//!
//! # Banking
//!
//! The CPU port at $01 bits 0-2 control which ROMs and I/O are visible:
//!
//! | HIRAM(2) | LORAM(1) | CHAREN(0) | $A000-$BFFF | $D000-$DFFF | $E000-$FFFF |
//! |----------|----------|-----------|-------------|-------------|-------------|
//! | 1        | 1        | 1         | BASIC       | I/O         | Kernal      |
//! | 1        | 1        | 0         | BASIC       | Char ROM    | Kernal      |
//! | 1        | 0        | x         | RAM         | I/O         | Kernal      |
//! | 0        | 1        | x         | RAM         | I/O         | RAM         |
//! | 0        | 0        | x         | RAM         | RAM         | RAM         |
//!
//! Bits 3-5 are the cassette lines: 3 write (out), 4 sense (in, low while a
//! button is held), 5 motor (out, low = on).
//!
//! Every RAM access goes through the active RAM expansion, if any.

use crate::memhack::MemHack;

/// Port bit carrying the cassette sense input.
pub const PORT_SENSE: u8 = 0x10;
/// Port bit driving the cassette write line.
pub const PORT_WRITE: u8 = 0x08;
/// Port bit switching the cassette motor (active low).
pub const PORT_MOTOR: u8 = 0x20;

const PORT_PULLUPS: u8 = 0x27;

/// C64 memory subsystem: 64K RAM + ROMs + colour RAM + 6510 port.
pub struct C64Memory {
    ram: Box<[u8; 0x10000]>,
    kernal_rom: Vec<u8>,
    basic_rom: Vec<u8>,
    char_rom: Vec<u8>,
    /// Colour RAM (1K nybbles at $D800-$DBFF).
    colour_ram: [u8; 1024],
    port_ddr: u8,
    port_data: u8,
    /// Sense line level seen on port bit 4.
    sense_released: bool,
    /// RAM expansion state. RAM reads and writes are routed through it.
    pub(crate) hack: MemHack,
}

impl C64Memory {
    /// ROM sizes are checked by [`Roms::validate`](crate::config::Roms::validate).
    #[must_use]
    pub fn new(kernal_rom: &[u8], basic_rom: &[u8], char_rom: &[u8], hack: MemHack) -> Self {
        Self {
            ram: Box::new([0; 0x10000]),
            kernal_rom: kernal_rom.to_vec(),
            basic_rom: basic_rom.to_vec(),
            char_rom: char_rom.to_vec(),
            colour_ram: [0; 1024],
            port_ddr: 0x2F,
            port_data: 0x37,
            sense_released: true,
            hack,
        }
    }

    /// Clear RAM and restore the port to its power-on state.
    pub fn power_on(&mut self) {
        self.ram.fill(0);
        self.colour_ram.fill(0);
        self.reset_port();
        self.hack.power_on();
    }

    /// Reset the 6510 port only.
    pub fn reset_port(&mut self) {
        self.port_ddr = 0x2F;
        self.port_data = 0x37;
    }

    fn hiram(&self) -> bool {
        self.effective_port() & 0x04 != 0
    }

    fn loram(&self) -> bool {
        self.effective_port() & 0x02 != 0
    }

    fn charen(&self) -> bool {
        self.effective_port() & 0x01 != 0
    }

    /// Effective port value: (data & ddr) | (external lines & !ddr).
    fn effective_port(&self) -> u8 {
        let external = PORT_PULLUPS | if self.sense_released { PORT_SENSE } else { 0 };
        (self.port_data & self.port_ddr) | (external & !self.port_ddr)
    }

    /// Port output levels, for the cassette motor and write lines.
    #[must_use]
    pub fn port_outputs(&self) -> u8 {
        self.effective_port()
    }

    #[must_use]
    pub fn port_registers(&self) -> (u8, u8) {
        (self.port_ddr, self.port_data)
    }

    pub fn set_port_registers(&mut self, ddr: u8, data: u8) {
        self.port_ddr = ddr;
        self.port_data = data;
    }

    /// Drive the cassette sense input (true = a button is held).
    pub fn set_tape_sense(&mut self, pressed: bool) {
        self.sense_released = !pressed;
    }

    /// Is the I/O area ($D000-$DFFF) visible to the CPU?
    #[must_use]
    pub fn is_io_visible(&self) -> bool {
        self.charen() && (self.hiram() || self.loram())
    }

    fn char_rom_visible(&self) -> bool {
        !self.charen() && self.hiram() && self.loram()
    }

    /// CPU read for RAM/ROM. The I/O area is routed by the machine when
    /// [`is_io_visible`](Self::is_io_visible).
    #[must_use]
    pub fn cpu_read(&self, addr: u16) -> u8 {
        match addr {
            0x0000 => self.port_ddr,
            0x0001 => self.effective_port(),
            0xA000..=0xBFFF if self.hiram() && self.loram() => {
                self.basic_rom[(addr - 0xA000) as usize]
            }
            0xD000..=0xDFFF if self.char_rom_visible() => {
                self.char_rom[(addr - 0xD000) as usize]
            }
            0xE000..=0xFFFF if self.hiram() => self.kernal_rom[(addr - 0xE000) as usize],
            _ => self.ram_read(addr),
        }
    }

    /// CPU write: always lands in RAM, except for the port.
    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000 => self.port_ddr = value,
            0x0001 => self.port_data = value,
            _ => self.ram_write(addr, value),
        }
    }

    /// VIC-II read of a full 16-bit address (bank already applied).
    /// Character ROM shows at $1000-$1FFF in banks 0 and 2.
    #[must_use]
    pub fn vic_read(&self, vic_bank: u8, bank_addr: u16) -> u8 {
        let bank_addr = bank_addr & 0x3FFF;
        if (vic_bank == 0 || vic_bank == 2) && (0x1000..0x2000).contains(&bank_addr) {
            return self.char_rom[(bank_addr - 0x1000) as usize];
        }
        let addr = (u16::from(vic_bank & 3) << 14) | bank_addr;
        self.hack
            .vic_read(&self.ram, addr)
            .unwrap_or(self.ram[addr as usize])
    }

    /// RAM as the CPU sees it, through any expansion.
    #[must_use]
    pub fn ram_read(&self, addr: u16) -> u8 {
        self.hack
            .cpu_read(&self.ram, addr)
            .unwrap_or(self.ram[addr as usize])
    }

    pub fn ram_write(&mut self, addr: u16, value: u8) {
        if !self.hack.cpu_write(&mut self.ram, addr, value) {
            self.ram[addr as usize] = value;
        }
    }

    /// The base 64K, bypassing expansions.
    #[must_use]
    pub fn base_ram(&self) -> &[u8; 0x10000] {
        &self.ram
    }

    pub fn base_ram_mut(&mut self) -> &mut [u8; 0x10000] {
        &mut self.ram
    }

    #[must_use]
    pub fn colour_ram_read(&self, offset: u16) -> u8 {
        self.colour_ram
            .get(offset as usize)
            .map_or(0, |&v| v & 0x0F)
    }

    pub fn colour_ram_write(&mut self, offset: u16, value: u8) {
        if let Some(slot) = self.colour_ram.get_mut(offset as usize) {
            *slot = value & 0x0F;
        }
    }

    #[must_use]
    pub fn colour_ram(&self) -> &[u8; 1024] {
        &self.colour_ram
    }

    pub fn colour_ram_mut(&mut self) -> &mut [u8; 1024] {
        &mut self.colour_ram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_memory() -> C64Memory {
        let kernal = vec![0xEE; 8192];
        let basic = vec![0xBB; 8192];
        let chargen = vec![0xCC; 4096];
        C64Memory::new(&kernal, &basic, &chargen, MemHack::default())
    }

    #[test]
    fn default_banking_sees_roms() {
        let mem = make_memory();
        assert_eq!(mem.cpu_read(0xA000), 0xBB);
        assert_eq!(mem.cpu_read(0xE000), 0xEE);
        assert!(mem.is_io_visible());
    }

    #[test]
    fn writes_go_to_ram_under_rom() {
        let mut mem = make_memory();
        mem.cpu_write(0xA000, 0x42);
        assert_eq!(mem.cpu_read(0xA000), 0xBB);
        assert_eq!(mem.ram_read(0xA000), 0x42);
    }

    #[test]
    fn all_ram_banking() {
        let mut mem = make_memory();
        mem.cpu_write(0x0001, 0x00);
        mem.ram[0xA000] = 0x42;
        mem.ram[0xD000] = 0x43;
        mem.ram[0xE000] = 0x44;
        assert_eq!(mem.cpu_read(0xA000), 0x42);
        assert_eq!(mem.cpu_read(0xD000), 0x43);
        assert_eq!(mem.cpu_read(0xE000), 0x44);
        assert!(!mem.is_io_visible());
    }

    #[test]
    fn char_rom_visible_when_charen_clear() {
        let mut mem = make_memory();
        mem.cpu_write(0x0001, 0x36);
        assert_eq!(mem.cpu_read(0xD000), 0xCC);
    }

    #[test]
    fn sense_line_shows_on_port_bit_4() {
        let mut mem = make_memory();
        assert_eq!(mem.cpu_read(0x0001) & PORT_SENSE, PORT_SENSE);
        mem.set_tape_sense(true);
        assert_eq!(mem.cpu_read(0x0001) & PORT_SENSE, 0);
        // An output-configured bit 4 ignores the external line.
        mem.cpu_write(0x0000, 0x3F);
        mem.cpu_write(0x0001, 0x10);
        assert_eq!(mem.cpu_read(0x0001) & PORT_SENSE, PORT_SENSE);
    }

    #[test]
    fn motor_line_follows_port() {
        let mut mem = make_memory();
        assert_eq!(mem.port_outputs() & PORT_MOTOR, PORT_MOTOR);
        mem.cpu_write(0x0001, 0x17);
        assert_eq!(mem.port_outputs() & PORT_MOTOR, 0);
    }

    #[test]
    fn vic_sees_char_rom_in_banks_0_and_2() {
        let mut mem = make_memory();
        mem.ram[0x5000] = 0xAA;
        assert_eq!(mem.vic_read(0, 0x1000), 0xCC);
        assert_eq!(mem.vic_read(2, 0x1800), 0xCC);
        assert_eq!(mem.vic_read(0, 0x0000), 0x00);
        assert_eq!(mem.vic_read(1, 0x1000), 0xAA);
    }

    #[test]
    fn colour_ram_keeps_low_nybble() {
        let mut mem = make_memory();
        mem.colour_ram_write(1, 0xFF);
        assert_eq!(mem.colour_ram_read(1), 0x0F);
        assert_eq!(mem.colour_ram_read(5000), 0);
    }

    #[test]
    fn power_on_clears_ram() {
        let mut mem = make_memory();
        mem.cpu_write(0x1234, 0x99);
        mem.cpu_write(0x0001, 0x30);
        mem.power_on();
        assert_eq!(mem.ram_read(0x1234), 0);
        assert_eq!(mem.port_registers(), (0x2F, 0x37));
    }
}
