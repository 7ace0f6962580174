//! Directory listing for tapes recorded in the standard CBM kernal format.
//!
//! # Pulse classes
//!
//! Gap bytes are classified into three pulse lengths (values are in
//! units of 8 cycles, as stored in the file):
//!
//! | Pulse | Range |
//! |-------|-------|
//! | Short | `0x24..=0x36` |
//! | Medium | `0x37..=0x49` |
//! | Long | `0x4A..=0x64` |
//!
//! # Byte encoding
//!
//! Every byte starts with a Long-Medium marker, followed by eight data bits
//! (LSB first) and an odd parity bit. A bit is two pulses: Short-Medium is
//! 0, Medium-Short is 1. Long-Short ends a block.
//!
//! Each block is preceded by a countdown: `$89..$81` for the first copy,
//! `$09..$01` for the repeat. Header blocks carry the file type, start and
//! end address, and a 16-byte name.

use std::ops::RangeInclusive;

const SHORT: RangeInclusive<u32> = 0x24..=0x36;
const MEDIUM: RangeInclusive<u32> = 0x37..=0x49;
const LONG: RangeInclusive<u32> = 0x4A..=0x64;

const FIRST_COPY: u8 = 0x89;
const REPEAT_COPY: u8 = 0x09;

/// Header size up to and including the name.
const MIN_HEADER_LEN: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulse {
    Short,
    Medium,
    Long,
    Other,
}

fn classify(units: u32) -> Pulse {
    if SHORT.contains(&units) {
        Pulse::Short
    } else if MEDIUM.contains(&units) {
        Pulse::Medium
    } else if LONG.contains(&units) {
        Pulse::Long
    } else {
        Pulse::Other
    }
}

/// Classify every gap, remembering the data offset it starts at.
fn extract_pulses(data: &[u8], version: u8) -> Vec<(Pulse, usize)> {
    let mut pulses = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0 && version >= 1 {
            if i + 3 >= data.len() {
                break;
            }
            let cycles = u32::from(data[i + 1])
                | (u32::from(data[i + 2]) << 8)
                | (u32::from(data[i + 3]) << 16);
            pulses.push((classify(cycles / 8), i));
            i += 4;
        } else {
            let pulse = if data[i] == 0 {
                Pulse::Other
            } else {
                classify(u32::from(data[i]))
            };
            pulses.push((pulse, i));
            i += 1;
        }
    }
    pulses
}

/// File type byte from a tape header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeFileType {
    /// Relocatable program (`LOAD "x",1`).
    Basic,
    SeqData,
    /// Non-relocatable program (`LOAD "x",1,1`).
    Program,
    SeqHeader,
    EndOfTape,
    Other(u8),
}

impl From<u8> for TapeFileType {
    fn from(v: u8) -> Self {
        match v {
            1 => TapeFileType::Basic,
            2 => TapeFileType::SeqData,
            3 => TapeFileType::Program,
            4 => TapeFileType::SeqHeader,
            5 => TapeFileType::EndOfTape,
            other => TapeFileType::Other(other),
        }
    }
}

/// One file found on the tape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeDirectoryEntry {
    pub file_type: TapeFileType,
    pub start_address: u16,
    pub end_address: u16,
    /// Raw PETSCII name, padded with spaces.
    pub name: [u8; 16],
    /// Data offset of the header block's countdown.
    pub offset: usize,
}

impl TapeDirectoryEntry {
    /// Name with padding stripped and non-printable bytes replaced.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .iter()
            .map(|&b| match b {
                0x20..=0x5F => b as char,
                _ => ' ',
            })
            .collect::<String>()
            .trim_end()
            .to_string()
    }
}

enum ByteRead {
    Byte(u8),
    EndOfBlock,
    Error,
}

struct Decoder<'a> {
    pulses: &'a [(Pulse, usize)],
    i: usize,
}

impl Decoder<'_> {
    fn pulse(&mut self) -> Option<Pulse> {
        let p = self.pulses.get(self.i).map(|&(p, _)| p);
        self.i += 1;
        p
    }

    fn bit(&mut self) -> Option<u8> {
        match (self.pulse()?, self.pulse()?) {
            (Pulse::Short, Pulse::Medium) => Some(0),
            (Pulse::Medium, Pulse::Short) => Some(1),
            _ => None,
        }
    }

    fn byte(&mut self) -> ByteRead {
        if self.pulse() != Some(Pulse::Long) {
            return ByteRead::Error;
        }
        match self.pulse() {
            Some(Pulse::Medium) => {}
            Some(Pulse::Short) => return ByteRead::EndOfBlock,
            _ => return ByteRead::Error,
        }

        let mut value = 0u8;
        let mut parity = 1;
        for i in 0..8 {
            let Some(bit) = self.bit() else {
                return ByteRead::Error;
            };
            value |= bit << i;
            parity ^= bit;
        }
        match self.bit() {
            Some(p) if p == parity => ByteRead::Byte(value),
            _ => ByteRead::Error,
        }
    }
}

/// Scan the gap data of a tape and list the files whose headers decode.
///
/// Repeat copies and the data blocks that follow program headers are
/// skipped. An end-of-tape header stops the scan.
#[must_use]
pub fn read_directory(data: &[u8], version: u8) -> Vec<TapeDirectoryEntry> {
    let pulses = extract_pulses(data, version);
    let mut entries = Vec::new();
    let mut expect_data = false;
    let mut i = 0;

    while i < pulses.len() {
        if pulses[i].0 != Pulse::Long {
            i += 1;
            continue;
        }
        let mut d = Decoder {
            pulses: &pulses,
            i,
        };
        let lead = match d.byte() {
            ByteRead::Byte(b) if b == FIRST_COPY || b == REPEAT_COPY => b,
            _ => {
                i += 1;
                continue;
            }
        };
        if !(1..=8).all(|k| matches!(d.byte(), ByteRead::Byte(b) if b == lead - k)) {
            i += 1;
            continue;
        }

        let offset = pulses[i].1;
        let mut payload = Vec::new();
        while let ByteRead::Byte(b) = d.byte() {
            payload.push(b);
        }
        i = d.i;

        if lead == REPEAT_COPY || payload.is_empty() {
            continue;
        }
        if expect_data {
            expect_data = false;
            continue;
        }

        let file_type = TapeFileType::from(payload[0]);
        match file_type {
            TapeFileType::EndOfTape => break,
            TapeFileType::Basic | TapeFileType::Program | TapeFileType::SeqHeader
                if payload.len() >= MIN_HEADER_LEN =>
            {
                let mut name = [0u8; 16];
                name.copy_from_slice(&payload[5..21]);
                entries.push(TapeDirectoryEntry {
                    file_type,
                    start_address: u16::from_le_bytes([payload[1], payload[2]]),
                    end_address: u16::from_le_bytes([payload[3], payload[4]]),
                    name,
                    offset,
                });
                expect_data = file_type != TapeFileType::SeqHeader;
            }
            _ => {
                log::trace!("skipping tape block of type {} at {offset}", payload[0]);
            }
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const S: u8 = 0x30;
    const M: u8 = 0x42;
    const L: u8 = 0x56;

    fn push_byte(out: &mut Vec<u8>, b: u8) {
        out.extend([L, M]);
        let mut parity = 1;
        for i in 0..8 {
            let bit = (b >> i) & 1;
            out.extend(if bit == 1 { [M, S] } else { [S, M] });
            parity ^= bit;
        }
        out.extend(if parity == 1 { [M, S] } else { [S, M] });
    }

    fn push_block(out: &mut Vec<u8>, lead: u8, payload: &[u8]) {
        out.extend([S; 64]);
        for k in 0..9 {
            push_byte(out, lead - k);
        }
        for &b in payload {
            push_byte(out, b);
        }
        out.extend([L, S]);
    }

    fn make_header(file_type: u8, start: u16, end: u16, name: &str) -> Vec<u8> {
        let mut h = vec![file_type];
        h.extend(start.to_le_bytes());
        h.extend(end.to_le_bytes());
        let mut padded = [0x20u8; 16];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        h.extend(padded);
        h.resize(192, 0x20);
        h
    }

    fn push_file(out: &mut Vec<u8>, header: &[u8], data: Option<&[u8]>) {
        push_block(out, FIRST_COPY, header);
        push_block(out, REPEAT_COPY, header);
        if let Some(data) = data {
            push_block(out, FIRST_COPY, data);
            push_block(out, REPEAT_COPY, data);
        }
    }

    #[test]
    fn lists_programs_and_sequential_files() {
        let mut tape = Vec::new();
        // Data block starting with 0x01 must not be taken for a header.
        push_file(
            &mut tape,
            &make_header(1, 0x0801, 0x0810, "HELLO"),
            Some(&[0x01, 0x08, 0x0B, 0x08]),
        );
        push_file(&mut tape, &make_header(4, 0x033C, 0x03FC, "LOG"), None);
        push_file(&mut tape, &make_header(5, 0, 0, ""), None);
        push_file(&mut tape, &make_header(3, 0xC000, 0xC100, "HIDDEN"), None);

        let dir = read_directory(&tape, 1);
        let listed: Vec<(TapeFileType, String, u16)> = dir
            .iter()
            .map(|e| (e.file_type, e.display_name(), e.start_address))
            .collect();
        assert_eq!(
            listed,
            vec![
                (TapeFileType::Basic, "HELLO".to_string(), 0x0801),
                (TapeFileType::SeqHeader, "LOG".to_string(), 0x033C),
            ]
        );
        assert_eq!(dir[0].offset, 64);
        assert_eq!(dir[0].end_address, 0x0810);
    }

    #[test]
    fn parity_errors_drop_the_block() {
        let mut tape = Vec::new();
        push_block(&mut tape, FIRST_COPY, &make_header(3, 0x1000, 0x2000, "BAD"));
        // Corrupt the parity bit of the first header byte.
        let first_payload_byte = 64 + 9 * 20;
        let parity = first_payload_byte + 18;
        tape.swap(parity, parity + 1);

        let dir = read_directory(&tape, 1);
        assert!(dir.is_empty());
    }

    #[test]
    fn empty_and_noise_tapes_list_nothing() {
        assert!(read_directory(&[], 0).is_empty());
        assert!(read_directory(&[0x10, 0x80, 0x00, 0x30], 0).is_empty());
    }
}
