//! CPU-facing memory interface.

/// Memory and I/O bus as seen by the CPU.
///
/// The machine decodes the address through its banking logic and I/O
/// router. The CPU core (an external collaborator) only sees this trait.
pub trait Bus {
    /// Read a byte, with side effects (I/O registers may clear on read).
    fn read(&mut self, address: u16) -> u8;

    /// Write a byte.
    fn write(&mut self, address: u16, value: u8);

    /// Read a byte without side effects, for monitors and debuggers.
    fn peek(&self, address: u16) -> u8;
}
