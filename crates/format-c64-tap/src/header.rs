//! TAP header (20 bytes).
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 12 | Signature `C64-TAPE-RAW` or `C16-TAPE-RAW` |
//! | 12 | 1 | Version (0, 1, 2) |
//! | 13 | 1 | System (0 C64, 1 VIC-20, 2 C16/+4) |
//! | 14 | 1 | Video standard |
//! | 15 | 1 | Reserved |
//! | 16 | 4 | Data length (LE) |

use crate::TapError;

pub const TAP_HEADER_SIZE: usize = 20;

pub(crate) const VERSION_OFFSET: usize = 12;
pub(crate) const LENGTH_OFFSET: u64 = 16;

const C64_SIGNATURE: &[u8; 12] = b"C64-TAPE-RAW";
const C16_SIGNATURE: &[u8; 12] = b"C16-TAPE-RAW";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapSignature {
    C64,
    C16,
}

/// Machine the tape was captured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapSystem {
    C64,
    Vic20,
    C16,
    Unknown(u8),
}

impl From<u8> for TapSystem {
    fn from(v: u8) -> Self {
        match v {
            0 => TapSystem::C64,
            1 => TapSystem::Vic20,
            2 => TapSystem::C16,
            other => TapSystem::Unknown(other),
        }
    }
}

impl From<TapSystem> for u8 {
    fn from(s: TapSystem) -> Self {
        match s {
            TapSystem::C64 => 0,
            TapSystem::Vic20 => 1,
            TapSystem::C16 => 2,
            TapSystem::Unknown(v) => v,
        }
    }
}

/// Video standard of the capturing machine (sets the cycle base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStandard {
    Pal,
    Ntsc,
    NtscOld,
    PalN,
    Unknown(u8),
}

impl From<u8> for VideoStandard {
    fn from(v: u8) -> Self {
        match v {
            0 => VideoStandard::Pal,
            1 => VideoStandard::Ntsc,
            2 => VideoStandard::NtscOld,
            3 => VideoStandard::PalN,
            other => VideoStandard::Unknown(other),
        }
    }
}

impl From<VideoStandard> for u8 {
    fn from(v: VideoStandard) -> Self {
        match v {
            VideoStandard::Pal => 0,
            VideoStandard::Ntsc => 1,
            VideoStandard::NtscOld => 2,
            VideoStandard::PalN => 3,
            VideoStandard::Unknown(x) => x,
        }
    }
}

/// Parsed TAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapHeader {
    pub signature: TapSignature,
    pub version: u8,
    pub system: TapSystem,
    pub video: VideoStandard,
    /// Data length as recorded in the header. May disagree with the file.
    pub data_length: u32,
}

impl TapHeader {
    /// Header for a freshly created image.
    #[must_use]
    pub fn new(version: u8) -> Self {
        Self {
            signature: TapSignature::C64,
            version,
            system: TapSystem::C64,
            video: VideoStandard::Pal,
            data_length: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, TapError> {
        if data.len() < TAP_HEADER_SIZE {
            return Err(TapError::BadSignature);
        }
        let signature = match &data[..12] {
            s if s == C64_SIGNATURE => TapSignature::C64,
            s if s == C16_SIGNATURE => TapSignature::C16,
            _ => return Err(TapError::BadSignature),
        };
        let version = data[VERSION_OFFSET];
        if version > 2 {
            return Err(TapError::UnsupportedVersion(version));
        }
        Ok(Self {
            signature,
            version,
            system: TapSystem::from(data[13]),
            video: VideoStandard::from(data[14]),
            data_length: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; TAP_HEADER_SIZE] {
        let mut out = [0u8; TAP_HEADER_SIZE];
        out[..12].copy_from_slice(match self.signature {
            TapSignature::C64 => C64_SIGNATURE,
            TapSignature::C16 => C16_SIGNATURE,
        });
        out[VERSION_OFFSET] = self.version;
        out[13] = self.system.into();
        out[14] = self.video.into();
        out[16..20].copy_from_slice(&self.data_length.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_c16_header() {
        let mut raw = TapHeader::new(2).to_bytes();
        raw[..12].copy_from_slice(b"C16-TAPE-RAW");
        raw[13] = 2;
        raw[14] = 1;
        raw[16] = 0x34;
        raw[17] = 0x12;

        let h = TapHeader::parse(&raw).expect("valid header");
        assert_eq!(h.signature, TapSignature::C16);
        assert_eq!(h.version, 2);
        assert_eq!(h.system, TapSystem::C16);
        assert_eq!(h.video, VideoStandard::Ntsc);
        assert_eq!(h.data_length, 0x1234);
    }

    #[test]
    fn rejects_unknown_signature_and_version() {
        let mut raw = TapHeader::new(1).to_bytes();
        raw[0] = b'X';
        assert!(matches!(TapHeader::parse(&raw), Err(TapError::BadSignature)));

        let mut raw = TapHeader::new(1).to_bytes();
        raw[VERSION_OFFSET] = 3;
        assert!(matches!(
            TapHeader::parse(&raw),
            Err(TapError::UnsupportedVersion(3))
        ));

        assert!(matches!(TapHeader::parse(&[0; 8]), Err(TapError::BadSignature)));
    }
}
