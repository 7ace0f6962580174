use std::io;

use emu_core::SnapshotError;
use format_c64_tap::TapError;
use thiserror::Error;

use crate::machine::ResetMode;

/// Machine-level error.
#[derive(Debug, Error)]
pub enum C64Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tap(#[from] TapError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    MemHack(#[from] MemHackError),
    #[error(transparent)]
    Tapeport(#[from] TapeportError),
}

/// Rejected configuration or resource value. The previous value is kept.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown resource `{0}`")]
    UnknownResource(String),
    #[error("invalid value {value} for `{name}`")]
    InvalidValue { name: String, value: String },
    #[error("{name} ROM must be {expected} bytes, got {actual}")]
    RomSize {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("bad configuration file: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(name: &str, value: impl std::fmt::Display) -> Self {
        ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// RAM expansion enable/disable failure.
#[derive(Debug, Error)]
pub enum MemHackError {
    #[error("cannot load or create expansion image {path}: {source}")]
    Image { path: String, source: io::Error },
    #[error("cannot save expansion image {path}: {source}")]
    Flush { path: String, source: io::Error },
    #[error("I/O source table is full")]
    IoTableFull,
}

/// A failed expansion switch. `reset` is still owed when the attempt
/// changed what is mapped.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SwitchError {
    pub error: MemHackError,
    pub reset: Option<ResetMode>,
}

impl From<SwitchError> for C64Error {
    fn from(e: SwitchError) -> Self {
        C64Error::MemHack(e.error)
    }
}

/// Tapeport device selection failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TapeportError {
    #[error("tapeport device id {0} is out of range")]
    InvalidId(u32),
    #[error("tapeport device id {0} is already registered")]
    Duplicate(u32),
    #[error("no tapeport device with id {0}")]
    UnknownDevice(u32),
    #[error("device `{name}` is not usable on port {port} of this machine")]
    Incompatible { name: &'static str, port: usize },
    #[error("device `{0}` failed to enable")]
    EnableFailed(&'static str),
    #[error("no tapeport {0}")]
    InvalidPort(usize),
}
