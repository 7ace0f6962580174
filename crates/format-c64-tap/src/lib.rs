//! Commodore TAP tape images.
//!
//! A TAP file is a 20-byte header followed by a stream of gap bytes. Each
//! gap is the time between two flux transitions on the tape.
//!
//! # Gap encoding
//!
//! | Version | Byte `n != 0` | Byte `0` |
//! |---------|---------------|----------|
//! | 0 | `n * 8` cycles | "long gap", decoded as a configured delay |
//! | 1, 2 | `n * 8` cycles | followed by 3 LE bytes of exact cycles (0 = configured delay) |
//!
//! Version 2 images come from C16/+4 machines where every value is a
//! half-wave; the datasette doubles them.

mod directory;
mod error;
mod header;
mod image;

pub use directory::{TapeDirectoryEntry, TapeFileType, read_directory};
pub use error::TapError;
pub use header::{TAP_HEADER_SIZE, TapHeader, TapSignature, TapSystem, VideoStandard};
pub use image::{
    Direction, LONG_GAP_THRESHOLD, MIN_PULSE, TAP_BUFFER_LENGTH, TapImage, TapeCounters,
};
