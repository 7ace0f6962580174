//! Core types for cycle-accurate emulation.
//!
//! One 64-bit cycle counter drives everything. Components never keep their
//! own notion of time; they read the clock from the [`AlarmContext`] and ask
//! it to call them back at a future cycle.

mod alarm;
mod bus;
mod observable;
pub mod snapshot;
mod ticks;

pub use alarm::{AlarmContext, AlarmHandler, AlarmId};
pub use bus::Bus;
pub use observable::{Observable, Value};
pub use snapshot::{ModuleReader, ModuleWriter, Snapshot, SnapshotError, SnapshotVersion};
pub use ticks::Ticks;
