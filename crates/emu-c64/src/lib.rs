//! Commodore 64/128 hardware core.
//!
//! Everything between the CPU and the chips: the memory map and 6510 port,
//! the I/O router that arbitrates overlapping devices, the RAM expansion
//! hacks, VIC-II bus glue, the datasette and the tape port. Instruction
//! execution, video rendering and sound synthesis are external; a CPU core
//! drives a [`Machine`] through [`emu_core::Bus`] and
//! [`Machine::advance`].
//!
//! The C64 master clock ticks at CPU cycle rate (985,248 Hz PAL). One PAL
//! frame is 312 raster lines x 63 cycles = 19,656 cycles.

mod cia;
pub mod config;
pub mod datasette;
mod error;
pub mod io;
mod machine;
pub mod memhack;
pub mod memory;
pub mod resources;
mod sid;
pub mod tapeport;
mod vdc;
pub mod vic;

pub use cia::Cia;
pub use config::{
    C64Model, DatasetteConfig, MachineConfig, MachineTiming, MemHackConfig, Roms, TapeportConfig,
    TimingStandard,
};
pub use datasette::{Datasette, DatasetteCommand, DatasetteMode, TapeBehaviour};
pub use error::{C64Error, ConfigError, MemHackError, SwitchError, TapeportError};
pub use io::{CollisionMode, IoRouter};
pub use machine::{Machine, ResetMode};
pub use memhack::{HackState, MemHack, MemHackKind};
pub use memory::C64Memory;
pub use resources::{Resource, ResourceValue};
pub use sid::Sid;
pub use vdc::Vdc;
