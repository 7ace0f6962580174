//! An open TAP file with a read-ahead window for gap decoding.
//!
//! Reading goes through a fixed window of [`TAP_BUFFER_LENGTH`] bytes.
//! `buffer[next]` always corresponds to file data offset `position`; the
//! window is refilled from disk whenever a read would step outside
//! `0..last`. Rewinding walks the same window backwards, re-reading the
//! chunk that ends at `position` when it underflows.
//!
//! Writes bypass the window: the caller clears it and the pulse goes
//! straight to the file at `position`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::TapError;
use crate::header::{LENGTH_OFFSET, TAP_HEADER_SIZE, TapHeader};

/// Size of the read-ahead window.
pub const TAP_BUFFER_LENGTH: usize = 100_000;

/// Shortest pulse (in cycles) that is recorded. Anything below is noise.
pub const MIN_PULSE: u64 = 7;

/// Pulses at or above this many cycles are written as a zero byte
/// plus an exact 24-bit count.
pub const LONG_GAP_THRESHOLD: u64 = 255 * 8 + 7;

const DATA_OFFSET: i64 = TAP_HEADER_SIZE as i64;

/// Blank image written by [`TapImage::create`]: a version 1 header whose
/// length field claims 4 data bytes, followed by 4 zero bytes.
const BLANK_IMAGE_LEN: usize = 24;

/// Tape transport direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Per-image transport counters, advanced by the datasette.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapeCounters {
    /// Tape position in units of 8 cycles.
    pub cycle_counter: u64,
    /// Length of the whole tape in the same units.
    pub cycle_counter_total: u64,
    /// Last value shown on the 3-digit counter.
    pub counter: u32,
}

/// An attached TAP image.
pub struct TapImage {
    path: PathBuf,
    file: File,
    header: TapHeader,
    read_only: bool,
    /// Data bytes after the header.
    size: u64,
    has_changed: bool,
    /// Data offset corresponding to `buffer[next]`.
    position: i64,
    buffer: Vec<u8>,
    next: i64,
    last: i64,
    pub counters: TapeCounters,
}

impl std::fmt::Debug for TapImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapImage")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("read_only", &self.read_only)
            .field("size", &self.size)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl TapImage {
    /// Open `path`. Unless `read_only` is requested the file is opened
    /// read-write, falling back to read-only if that fails.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self, TapError> {
        let path = path.as_ref();
        let (mut file, read_only) = if read_only {
            (File::open(path)?, true)
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => (f, false),
                Err(e) => {
                    log::debug!(
                        "{}: read-write open failed ({e}), retrying read-only",
                        path.display()
                    );
                    (File::open(path)?, true)
                }
            }
        };

        let mut raw = [0u8; TAP_HEADER_SIZE];
        file.read_exact(&mut raw).map_err(|_| TapError::BadSignature)?;
        let header = TapHeader::parse(&raw)?;

        let len = file.metadata()?.len();
        let size = len.saturating_sub(TAP_HEADER_SIZE as u64);
        if size < 3 {
            return Err(TapError::TooShort(size));
        }
        if u64::from(header.data_length) != size {
            log::debug!(
                "{}: header length {} disagrees with file ({size} data bytes)",
                path.display(),
                header.data_length
            );
        }

        log::info!(
            "opened TAP image {} (version {}, {size} bytes{})",
            path.display(),
            header.version,
            if read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            read_only,
            size,
            has_changed: false,
            position: 0,
            buffer: vec![0; TAP_BUFFER_LENGTH],
            next: 0,
            last: 0,
            counters: TapeCounters::default(),
        })
    }

    /// Write a blank version 1 image to `path`, replacing any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<(), TapError> {
        let mut header = TapHeader::new(1);
        header.data_length = 4;
        let mut block = [0u8; BLANK_IMAGE_LEN];
        block[..TAP_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        File::create(path.as_ref())?.write_all(&block)?;
        Ok(())
    }

    /// Flush the length field if the image was written to. Dropping the
    /// image does the same, ignoring errors.
    pub fn close(mut self) -> Result<(), TapError> {
        self.flush_length()
    }

    fn flush_length(&mut self) -> Result<(), TapError> {
        if !self.has_changed {
            return Ok(());
        }
        let len = u32::try_from(self.size).unwrap_or(u32::MAX);
        self.file.seek(SeekFrom::Start(LENGTH_OFFSET))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.flush()?;
        self.has_changed = false;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> &TapHeader {
        &self.header
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.header.version
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    /// Current data offset.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.max(0) as u64
    }

    /// Rewind to the first data byte and drop the read window.
    pub fn seek_start(&mut self) {
        self.position = 0;
        self.clear_buffer();
    }

    /// Move to data offset `pos` and drop the read window.
    pub fn seek_to(&mut self, pos: u64) {
        self.position = i64::try_from(pos.min(self.size)).unwrap_or(0);
        self.clear_buffer();
    }

    /// Forget the read window; the next read refills it from disk.
    pub fn clear_buffer(&mut self) {
        self.next = 0;
        self.last = 0;
    }

    /// Seek the underlying file to the current position. Done when the
    /// motor starts so a following write lands in the right place.
    pub fn sync_file_position(&mut self) -> Result<(), TapError> {
        self.file
            .seek(SeekFrom::Start((self.position + DATA_OFFSET) as u64))?;
        Ok(())
    }

    /// Read the whole data area, for directory scans.
    pub fn read_data(&mut self) -> Result<Vec<u8>, TapError> {
        let mut data = Vec::with_capacity(self.size as usize);
        self.file.seek(SeekFrom::Start(DATA_OFFSET as u64))?;
        (&mut self.file).take(self.size).read_to_end(&mut data)?;
        self.clear_buffer();
        Ok(data)
    }

    fn fill_from(&mut self, data_offset: i64) -> bool {
        if let Err(e) = self.file.seek(SeekFrom::Start((data_offset + DATA_OFFSET) as u64)) {
            log::error!("cannot read in tap-file: {e}");
            return false;
        }
        let mut filled = 0;
        while filled < TAP_BUFFER_LENGTH {
            match self.file.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("cannot read in tap-file: {e}");
                    return false;
                }
            }
        }
        self.last = filled as i64;
        true
    }

    /// Make sure `buffer[next + offset]` is inside the window.
    fn move_buffer_forward(&mut self, offset: i64) -> bool {
        if self.next + offset >= self.last {
            if !self.fill_from(self.position) {
                return false;
            }
            self.next = 0;
            if self.next >= self.last {
                return false;
            }
        }
        true
    }

    /// Make sure `buffer[next + offset]` is inside the window, reloading
    /// the chunk that ends at `position`.
    fn move_buffer_back(&mut self, offset: i64) -> bool {
        if self.next + offset < 0 {
            self.next = self.position.min(TAP_BUFFER_LENGTH as i64);
            if !self.fill_from(self.position - self.next) {
                return false;
            }
            if self.next > self.last {
                return false;
            }
        }
        true
    }

    /// Decode the gap at `read_tap`, returning cycles and its encoded
    /// length in bytes.
    fn fetch_gap(&self, read_tap: i64, zero_gap_delay: u64) -> Option<(u64, i64)> {
        if read_tap >= self.last || read_tap < 0 {
            return None;
        }
        let b = self.buffer[read_tap as usize];
        if self.header.version == 0 || b != 0 {
            let gap = if b != 0 {
                u64::from(b) * 8
            } else {
                zero_gap_delay
            };
            return Some((gap, 1));
        }

        if read_tap >= self.last - 3 {
            return None;
        }
        let i = read_tap as usize;
        let gap = u64::from(self.buffer[i + 1])
            | (u64::from(self.buffer[i + 2]) << 8)
            | (u64::from(self.buffer[i + 3]) << 16);
        Some((if gap == 0 { zero_gap_delay } else { gap }, 4))
    }

    /// Locate the start of the gap before `position` when the byte four
    /// back is a zero, which may or may not be a long-gap marker. Walks back
    /// until three non-zero bytes in a row give an anchor, then parses
    /// forward to the last gap that starts before `position`.
    fn read_tap_backward_v1(&mut self) -> Option<i64> {
        let remember = self.position;
        self.position -= 4;
        self.next -= 4;

        let mut non_zeros = 0;
        while non_zeros < 3 && self.position != 0 {
            if !self.move_buffer_back(-1) {
                return None;
            }
            self.position -= 1;
            self.next -= 1;
            if self.buffer[self.next as usize] != 0 {
                non_zeros += 1;
            } else {
                non_zeros = 0;
            }
        }

        loop {
            if !self.move_buffer_forward(1) {
                return None;
            }
            let step = if self.buffer[self.next as usize] != 0 { 1 } else { 4 };
            if self.position + step >= remember {
                break;
            }
            self.position += step;
            self.next += step;
        }
        if !self.move_buffer_forward(4) {
            return None;
        }

        let read_tap = self.next;
        self.next += remember - self.position;
        self.position = remember;
        Some(read_tap)
    }

    /// Read the next gap in `direction`, in cycles. Zero-valued gaps decode
    /// to `zero_gap_delay`. Returns `None` at either end of the tape.
    pub fn read_gap(&mut self, direction: Direction, zero_gap_delay: u64) -> Option<u64> {
        let read_tap = match direction {
            Direction::Forward => {
                if !self.move_buffer_forward(4) {
                    return None;
                }
                self.next
            }
            Direction::Backward => {
                if !self.move_buffer_back(-4) {
                    return None;
                }
                if self.header.version == 0
                    || self.next < 4
                    || self.buffer[(self.next - 4) as usize] != 0
                {
                    self.next - 1
                } else {
                    self.read_tap_backward_v1()?
                }
            }
        };

        let (gap, len) = self.fetch_gap(read_tap, zero_gap_delay)?;
        let step = direction.sign() * len;
        self.next += step;
        self.position += step;
        Some(gap)
    }

    /// Append one recorded pulse of `cycles` at the current position.
    /// Returns the number of data bytes written.
    pub fn write_pulse(&mut self, cycles: u64) -> Result<usize, TapError> {
        if self.read_only {
            return Err(TapError::ReadOnly);
        }
        let mut out = [0u8; 4];
        let len = if cycles < LONG_GAP_THRESHOLD {
            out[0] = (cycles / 8) as u8;
            1
        } else if self.header.version >= 1 {
            let c = cycles.min(0xFF_FFFF) as u32;
            out[1..4].copy_from_slice(&c.to_le_bytes()[..3]);
            4
        } else {
            1
        };

        self.file
            .seek(SeekFrom::Start((self.position + DATA_OFFSET) as u64))?;
        self.file.write_all(&out[..len])?;

        self.position += len as i64;
        self.size = self.size.max(self.position as u64);
        self.has_changed = true;
        Ok(len)
    }
}

impl Drop for TapImage {
    fn drop(&mut self) {
        if let Err(e) = self.flush_length() {
            log::warn!("{}: could not update TAP length: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use test_case::test_case;

    fn make_image(dir: &TempDir, version: u8, data: &[u8]) -> TapImage {
        let path = dir.path().join("t.tap");
        let mut header = TapHeader::new(version);
        header.data_length = data.len() as u32;
        let mut raw = header.to_bytes().to_vec();
        raw.extend_from_slice(data);
        std::fs::write(&path, raw).expect("write fixture");
        TapImage::open(&path, false).expect("open fixture")
    }

    fn read_all(img: &mut TapImage, dir: Direction) -> Vec<u64> {
        std::iter::from_fn(|| img.read_gap(dir, 2500)).collect()
    }

    #[test_case(0, &[0x30, 0x00, 0x40], &[0x180, 2500, 0x200] ; "v0 zero is the configured delay")]
    #[test_case(1, &[0x30, 0x00, 0x10, 0x27, 0x00, 0x40], &[0x180, 10000, 0x200] ; "v1 zero introduces exact count")]
    #[test_case(1, &[0x30, 0x00, 0x00, 0x00, 0x00, 0x40], &[0x180, 2500, 0x200] ; "v1 zero count is the configured delay")]
    fn forward_gaps(version: u8, data: &[u8], expected: &[u64]) {
        let dir = TempDir::new().expect("tempdir");
        let mut img = make_image(&dir, version, data);
        assert_eq!(read_all(&mut img, Direction::Forward), expected);
        assert_eq!(img.position(), data.len() as u64);
    }

    #[test]
    fn truncated_long_gap_ends_tape() {
        let dir = TempDir::new().expect("tempdir");
        let mut img = make_image(&dir, 1, &[0x30, 0x00, 0x10]);
        assert_eq!(read_all(&mut img, Direction::Forward), vec![0x180]);
    }

    #[test]
    fn backward_reads_mirror_forward() {
        let dir = TempDir::new().expect("tempdir");
        let data = [0x30, 0x31, 0x00, 0x10, 0x27, 0x00, 0x32, 0x33, 0x34];
        let mut img = make_image(&dir, 1, &data);

        let forward = read_all(&mut img, Direction::Forward);
        assert_eq!(forward, vec![0x180, 0x188, 10000, 0x190, 0x198, 0x1A0]);

        let mut backward = read_all(&mut img, Direction::Backward);
        backward.reverse();
        assert_eq!(backward, forward);
        assert_eq!(img.position(), 0);
    }

    #[test]
    fn short_images_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("short.tap");
        let mut raw = TapHeader::new(1).to_bytes().to_vec();
        raw.extend_from_slice(&[1, 2]);
        std::fs::write(&path, raw).expect("write");
        assert!(matches!(TapImage::open(&path, true), Err(TapError::TooShort(2))));
    }

    #[test]
    fn create_writes_blank_v1_image() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("new.tap");
        TapImage::create(&path).expect("create");

        let raw = std::fs::read(&path).expect("read back");
        assert_eq!(raw.len(), 24);
        assert_eq!(&raw[..12], b"C64-TAPE-RAW");
        assert_eq!(raw[12], 1);
        assert_eq!(&raw[16..20], &[4, 0, 0, 0]);

        let img = TapImage::open(&path, false).expect("reopen");
        assert_eq!(img.size(), 4);
        assert!(!img.is_read_only());
    }

    #[test]
    fn writes_extend_and_update_length_on_close() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("rec.tap");
        TapImage::create(&path).expect("create");

        let mut img = TapImage::open(&path, false).expect("open");
        img.seek_to(4);
        assert_eq!(img.write_pulse(0x180).expect("short"), 1);
        assert_eq!(img.write_pulse(20_000).expect("long"), 4);
        assert!(img.has_changed());
        assert_eq!(img.size(), 9);
        img.close().expect("close");

        let raw = std::fs::read(&path).expect("read back");
        assert_eq!(&raw[16..20], &[9, 0, 0, 0]);
        assert_eq!(&raw[24..], &[0x30, 0x00, 0x20, 0x4E, 0x00]);
    }

    #[test]
    fn read_only_image_refuses_writes() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ro.tap");
        TapImage::create(&path).expect("create");
        let mut img = TapImage::open(&path, true).expect("open");
        assert!(img.is_read_only());
        assert!(matches!(img.write_pulse(100), Err(TapError::ReadOnly)));
    }

    #[test]
    fn window_refills_across_buffer_boundary() {
        let dir = TempDir::new().expect("tempdir");
        let data = vec![0x20u8; TAP_BUFFER_LENGTH + 10];
        let mut img = make_image(&dir, 1, &data);
        let gaps = read_all(&mut img, Direction::Forward);
        assert_eq!(gaps.len(), data.len());
        assert!(gaps.iter().all(|&g| g == 0x100));

        let back = read_all(&mut img, Direction::Backward);
        assert_eq!(back.len(), data.len());
    }
}
