//! Snapshot container with named, versioned modules.
//!
//! A snapshot is a byte stream: a header followed by modules. Each
//! subsystem writes its own module and reads it back independently, so a
//! newer or broken module never corrupts the ones around it.
//!
//! # Layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic `C64S` |
//! | 4 | 1 | Container major version |
//! | 5 | 1 | Container minor version |
//!
//! Each module:
//!
//! | Size | Field |
//! |------|-------|
//! | 16 | Name, NUL padded |
//! | 1 | Major version |
//! | 1 | Minor version |
//! | 4 | Payload length (LE) |
//! | n | Payload |
//!
//! All multi-byte payload values are little-endian.

use thiserror::Error;

const MAGIC: &[u8; 4] = b"C64S";
const CONTAINER_MAJOR: u8 = 1;
const CONTAINER_MINOR: u8 = 0;
const HEADER_LEN: usize = 6;
const NAME_LEN: usize = 16;
const MODULE_HEADER_LEN: usize = NAME_LEN + 2 + 4;

/// Errors raised while reading or writing snapshots.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("not a snapshot (bad magic)")]
    BadMagic,
    #[error("snapshot container version {0}.{1} is not supported")]
    UnsupportedContainer(u8, u8),
    #[error("module `{0}` not found")]
    ModuleNotFound(String),
    #[error("module name `{0}` is longer than 16 bytes")]
    NameTooLong(String),
    #[error("module `{module}` version {found} is newer than supported {supported}")]
    VersionTooNew {
        module: String,
        found: SnapshotVersion,
        supported: SnapshotVersion,
    },
    #[error("module `{module}` version {found} is incompatible with {supported}")]
    IncompatibleVersion {
        module: String,
        found: SnapshotVersion,
        supported: SnapshotVersion,
    },
    #[error("module `{0}` is truncated")]
    Truncated(String),
    #[error("module `{module}`: {reason}")]
    InvalidData { module: String, reason: String },
}

/// Major/minor version of a snapshot module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotVersion {
    pub major: u8,
    pub minor: u8,
}

impl SnapshotVersion {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl std::fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An in-memory snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    buf: Vec<u8>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    /// An empty snapshot ready for modules.
    #[must_use]
    pub fn new() -> Self {
        let mut buf = Vec::with_capacity(0x20000);
        buf.extend_from_slice(MAGIC);
        buf.push(CONTAINER_MAJOR);
        buf.push(CONTAINER_MINOR);
        Self { buf }
    }

    /// Wrap bytes previously produced by [`Snapshot::into_bytes`].
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, SnapshotError> {
        if buf.len() < HEADER_LEN || &buf[..4] != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        if buf[4] != CONTAINER_MAJOR || buf[5] > CONTAINER_MINOR {
            return Err(SnapshotError::UnsupportedContainer(buf[4], buf[5]));
        }
        let snapshot = Self { buf };
        // Walk the module chain once so later lookups can trust the lengths.
        snapshot.modules()?;
        Ok(snapshot)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Start a new module. The length field is patched when the writer is
    /// dropped.
    pub fn module_writer(
        &mut self,
        name: &str,
        version: SnapshotVersion,
    ) -> Result<ModuleWriter<'_>, SnapshotError> {
        if name.len() > NAME_LEN {
            return Err(SnapshotError::NameTooLong(name.to_string()));
        }
        let start = self.buf.len();
        let mut padded = [0u8; NAME_LEN];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        self.buf.extend_from_slice(&padded);
        self.buf.push(version.major);
        self.buf.push(version.minor);
        self.buf.extend_from_slice(&[0; 4]);
        Ok(ModuleWriter {
            buf: &mut self.buf,
            start,
        })
    }

    /// Open a module by name.
    pub fn module(&self, name: &str) -> Result<ModuleReader<'_>, SnapshotError> {
        self.find_module(name)?
            .ok_or_else(|| SnapshotError::ModuleNotFound(name.to_string()))
    }

    /// Open a module by name, `None` if absent.
    pub fn find_module(&self, name: &str) -> Result<Option<ModuleReader<'_>>, SnapshotError> {
        Ok(self.modules()?.into_iter().find(|m| m.name == name))
    }

    /// Names of all modules, in write order.
    pub fn module_names(&self) -> Result<Vec<String>, SnapshotError> {
        Ok(self.modules()?.into_iter().map(|m| m.name).collect())
    }

    fn modules(&self) -> Result<Vec<ModuleReader<'_>>, SnapshotError> {
        let mut out = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < self.buf.len() {
            let header = self
                .buf
                .get(pos..pos + MODULE_HEADER_LEN)
                .ok_or_else(|| SnapshotError::Truncated("<header>".to_string()))?;
            let name_end = header[..NAME_LEN]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(NAME_LEN);
            let name = String::from_utf8_lossy(&header[..name_end]).into_owned();
            let version = SnapshotVersion::new(header[NAME_LEN], header[NAME_LEN + 1]);
            let len = u32::from_le_bytes([
                header[NAME_LEN + 2],
                header[NAME_LEN + 3],
                header[NAME_LEN + 4],
                header[NAME_LEN + 5],
            ]) as usize;
            let body_start = pos + MODULE_HEADER_LEN;
            let data = self
                .buf
                .get(body_start..body_start + len)
                .ok_or_else(|| SnapshotError::Truncated(name.clone()))?;
            out.push(ModuleReader {
                name,
                version,
                data,
                pos: 0,
            });
            pos = body_start + len;
        }
        Ok(out)
    }
}

/// Appends one module's payload. Patches the module length on drop.
pub struct ModuleWriter<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl ModuleWriter<'_> {
    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    /// Cycle values are stored as 64-bit.
    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed (u32) byte block.
    pub fn write_block(&mut self, v: &[u8]) -> &mut Self {
        self.write_u32(v.len() as u32);
        self.write_bytes(v)
    }
}

impl Drop for ModuleWriter<'_> {
    fn drop(&mut self) {
        let len = (self.buf.len() - self.start - MODULE_HEADER_LEN) as u32;
        let at = self.start + NAME_LEN + 2;
        self.buf[at..at + 4].copy_from_slice(&len.to_le_bytes());
    }
}

/// Sequential reader over one module's payload.
#[derive(Debug, Clone)]
pub struct ModuleReader<'a> {
    name: String,
    version: SnapshotVersion,
    data: &'a [u8],
    pos: usize,
}

impl<'a> ModuleReader<'a> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    /// Reject the module unless its major matches and its minor is not
    /// newer than `supported`. Returns the module's own version so callers
    /// can default fields that older minors lack.
    pub fn check_version(
        &self,
        supported: SnapshotVersion,
    ) -> Result<SnapshotVersion, SnapshotError> {
        if self.version > supported {
            return Err(SnapshotError::VersionTooNew {
                module: self.name.clone(),
                found: self.version,
                supported,
            });
        }
        if self.version.major != supported.major {
            return Err(SnapshotError::IncompatibleVersion {
                module: self.name.clone(),
                found: self.version,
                supported,
            });
        }
        Ok(self.version)
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let data: &'a [u8] = self.data;
        let out = data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| SnapshotError::Truncated(self.name.clone()))?;
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], SnapshotError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, SnapshotError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, SnapshotError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, SnapshotError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, SnapshotError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a block written by [`ModuleWriter::write_block`].
    pub fn read_block(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Copy exactly `out.len()` bytes.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<(), SnapshotError> {
        out.copy_from_slice(self.read_bytes(out.len())?);
        Ok(())
    }

    /// Build an [`SnapshotError::InvalidData`] for this module.
    #[must_use]
    pub fn invalid(&self, reason: impl Into<String>) -> SnapshotError {
        SnapshotError::InvalidData {
            module: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const V1_0: SnapshotVersion = SnapshotVersion::new(1, 0);

    #[test]
    fn modules_are_found_by_name() {
        let mut snap = Snapshot::new();
        {
            let mut m = snap.module_writer("FIRST", V1_0).expect("writer");
            m.write_u8(7).write_u32(0xDEAD_BEEF);
        }
        {
            let mut m = snap
                .module_writer("SECOND", SnapshotVersion::new(0, 3))
                .expect("writer");
            m.write_u64(1 << 40).write_i32(-2).write_block(&[1, 2, 3]);
        }

        let snap = Snapshot::from_bytes(snap.into_bytes()).expect("valid");
        assert_eq!(
            snap.module_names().expect("names"),
            vec!["FIRST".to_string(), "SECOND".to_string()]
        );

        let mut second = snap.module("SECOND").expect("second");
        assert_eq!(second.version(), SnapshotVersion::new(0, 3));
        assert_eq!(second.read_u64().expect("u64"), 1 << 40);
        assert_eq!(second.read_i32().expect("i32"), -2);
        assert_eq!(second.read_block().expect("block"), &[1, 2, 3]);
        assert_eq!(second.remaining(), 0);

        let mut first = snap.module("FIRST").expect("first");
        assert_eq!(first.read_u8().expect("u8"), 7);
        assert_eq!(first.read_u32().expect("u32"), 0xDEAD_BEEF);
    }

    #[test]
    fn reading_past_the_end_is_truncation() {
        let mut snap = Snapshot::new();
        snap.module_writer("SHORT", V1_0).expect("writer").write_u8(1);
        let mut m = snap.module("SHORT").expect("module");
        assert_eq!(m.read_u8(), Ok(1));
        assert_eq!(m.read_u32(), Err(SnapshotError::Truncated("SHORT".into())));
    }

    #[test]
    fn newer_minor_is_rejected_older_accepted() {
        let mut snap = Snapshot::new();
        snap.module_writer("NEW", SnapshotVersion::new(1, 6)).expect("writer");
        snap.module_writer("OLD", SnapshotVersion::new(1, 2)).expect("writer");
        snap.module_writer("MAJOR", SnapshotVersion::new(0, 9)).expect("writer");

        let supported = SnapshotVersion::new(1, 5);
        assert!(matches!(
            snap.module("NEW").expect("new").check_version(supported),
            Err(SnapshotError::VersionTooNew { .. })
        ));
        assert_eq!(
            snap.module("OLD").expect("old").check_version(supported),
            Ok(SnapshotVersion::new(1, 2))
        );
        assert!(matches!(
            snap.module("MAJOR").expect("major").check_version(supported),
            Err(SnapshotError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn bad_input_is_rejected() {
        assert_eq!(
            Snapshot::from_bytes(b"NOPE..".to_vec()).err(),
            Some(SnapshotError::BadMagic)
        );

        let mut snap = Snapshot::new();
        snap.module_writer("CUT", V1_0)
            .expect("writer")
            .write_bytes(&[0; 32]);
        let mut bytes = snap.into_bytes();
        bytes.truncate(bytes.len() - 4);
        assert_eq!(
            Snapshot::from_bytes(bytes).err(),
            Some(SnapshotError::Truncated("CUT".into()))
        );

        let mut snap = Snapshot::new();
        assert!(matches!(
            snap.module_writer("A_NAME_THAT_IS_TOO_LONG", V1_0),
            Err(SnapshotError::NameTooLong(_))
        ));
        assert!(matches!(
            snap.module("MISSING"),
            Err(SnapshotError::ModuleNotFound(_))
        ));
    }
}
