use std::io;

use thiserror::Error;

/// Errors from opening, creating or writing TAP images.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("tape image I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("not a TAP image (bad signature)")]
    BadSignature,
    #[error("unsupported TAP version {0}")]
    UnsupportedVersion(u8),
    #[error("TAP image too short: {0} data bytes")]
    TooShort(u64),
    #[error("TAP image is read-only")]
    ReadOnly,
}
