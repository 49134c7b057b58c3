//! Intel HEX text firmware images.
//!
//! Each record is `:LLAAAATT<data>CC`: byte count, 16-bit address, record
//! type, `LL` data bytes, and a checksum making the byte sum zero mod 256.
//!
//! | Type | Meaning                                   |
//! |------|-------------------------------------------|
//! | 00   | data                                      |
//! | 01   | end of file                               |
//! | 02   | extended segment address (base = v << 4)  |
//! | 03   | start segment address (ignored)           |
//! | 04   | extended linear address (base = v << 16)  |
//! | 05   | start linear address (ignored)            |
//!
//! [`decode`] flattens the data records into a [`FlatImage`] starting at the
//! lowest addressed byte. Gaps between records read as `0xFF`, the erased
//! state of flash.

use std::fmt::Write as _;
use thiserror::Error;
use tracing::trace;

/// Largest flat image accepted, in bytes
pub const MAX_IMAGE_SIZE: usize = 16 * 1024 * 1024;

/// Data bytes per record emitted by [`encode`]
pub const RECORD_DATA_LEN: usize = 16;

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT: u8 = 0x02;
const START_SEGMENT: u8 = 0x03;
const EXTENDED_LINEAR: u8 = 0x04;
const START_LINEAR: u8 = 0x05;

/// A hex decoding failure; line numbers are 1-based
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HexError {
    /// Record bytes do not sum to zero
    #[error("line {line}: checksum mismatch (stored {stored:#04x}, computed {computed:#04x})")]
    Checksum {
        /// Line of the record
        line: usize,
        /// Checksum byte in the record
        stored: u8,
        /// Checksum the record should carry
        computed: u8,
    },
    /// Anything else structurally wrong
    #[error("line {line}: {details}")]
    Format {
        /// Line of the record
        line: usize,
        /// What was wrong
        details: String,
    },
}

impl HexError {
    fn format(line: usize, details: impl Into<String>) -> Self {
        Self::Format {
            line,
            details: details.into(),
        }
    }
}

/// A contiguous memory image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatImage {
    /// Address of `data[0]`
    pub base_address: u32,
    /// Image bytes, gaps filled with `0xFF`
    pub data: Vec<u8>,
}

struct Record {
    kind: u8,
    address: u16,
    data: Vec<u8>,
}

/// Decodes a complete hex stream into a flat image
pub fn decode(text: &[u8]) -> Result<FlatImage, HexError> {
    decode_with_limit(text, MAX_IMAGE_SIZE)
}

/// Decodes a complete hex stream, rejecting images larger than `max_size`
pub fn decode_with_limit(text: &[u8], max_size: usize) -> Result<FlatImage, HexError> {
    let mut base: u64 = 0;
    let mut chunks: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut lines = 0;

    for (index, raw) in text.split(|&b| b == b'\n').enumerate() {
        let line = index + 1;
        lines = line;
        let trimmed = trim(raw);
        if trimmed.is_empty() {
            continue;
        }

        let record = parse_record(trimmed, line)?;
        match record.kind {
            DATA => {
                if !record.data.is_empty() {
                    chunks.push((base + record.address as u64, record.data));
                }
            }
            END_OF_FILE => {
                if !record.data.is_empty() {
                    return Err(HexError::format(line, "end-of-file record carries data"));
                }
                trace!("End-of-file record at line {}", line);
                return flatten(chunks, max_size, line);
            }
            EXTENDED_SEGMENT => base = (address_word(&record, line)? as u64) << 4,
            EXTENDED_LINEAR => base = (address_word(&record, line)? as u64) << 16,
            START_SEGMENT | START_LINEAR => {
                trace!("Ignoring start address record at line {}", line);
            }
            other => {
                return Err(HexError::format(line, format!("unknown record type {other:02X}")));
            }
        }
    }

    Err(HexError::format(lines, "missing end-of-file record"))
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

fn parse_record(text: &[u8], line: usize) -> Result<Record, HexError> {
    let digits = text
        .strip_prefix(b":")
        .ok_or_else(|| HexError::format(line, "record does not start with ':'"))?;
    if digits.len() % 2 != 0 {
        return Err(HexError::format(line, "odd number of hex digits"));
    }

    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        match (hex_nibble(pair[0]), hex_nibble(pair[1])) {
            (Ok(hi), Ok(lo)) => bytes.push((hi << 4) | lo),
            _ => return Err(HexError::format(line, "invalid hex digit")),
        }
    }

    if bytes.len() < 5 {
        return Err(HexError::format(line, "record shorter than its header"));
    }
    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(HexError::format(
            line,
            format!("byte count {count} but {} data bytes present", bytes.len() - 5),
        ));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - 1);
    let stored = checksum[0];
    let computed = record_checksum(body);
    if stored != computed {
        return Err(HexError::Checksum {
            line,
            stored,
            computed,
        });
    }

    Ok(Record {
        kind: body[3],
        address: u16::from_be_bytes([body[1], body[2]]),
        data: body[4..].to_vec(),
    })
}

fn address_word(record: &Record, line: usize) -> Result<u16, HexError> {
    match record.data.as_slice() {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(HexError::format(
            line,
            format!("address record needs 2 data bytes, has {}", record.data.len()),
        )),
    }
}

fn flatten(chunks: Vec<(u64, Vec<u8>)>, max_size: usize, line: usize) -> Result<FlatImage, HexError> {
    let Some(start) = chunks.iter().map(|(address, _)| *address).min() else {
        return Ok(FlatImage::default());
    };
    let end = chunks
        .iter()
        .map(|(address, data)| address + data.len() as u64)
        .max()
        .unwrap_or(start);

    let span = end - start;
    if span > max_size as u64 {
        return Err(HexError::format(
            line,
            format!("image spans {span} bytes from {start:#x}, limit is {max_size}"),
        ));
    }
    let base_address = u32::try_from(start)
        .map_err(|_| HexError::format(line, format!("start address {start:#x} exceeds 32 bits")))?;

    let mut data = vec![0xFF; span as usize];
    for (address, bytes) in chunks {
        let offset = (address - start) as usize;
        data[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }

    Ok(FlatImage { base_address, data })
}

/// Encodes an image as 16-byte data records plus extended linear address
/// records where the upper address half changes
pub fn encode(image: &FlatImage) -> String {
    let mut out = String::new();
    let mut upper: u16 = 0;
    let mut position = 0;

    while position < image.data.len() {
        let address = image.base_address as u64 + position as u64;
        let high = (address >> 16) as u16;
        let low = (address & 0xFFFF) as u16;
        if high != upper {
            push_record(&mut out, EXTENDED_LINEAR, 0, &high.to_be_bytes());
            upper = high;
        }

        // Records never cross a 64 KiB boundary
        let room = 0x1_0000 - low as usize;
        let len = RECORD_DATA_LEN.min(room).min(image.data.len() - position);
        push_record(&mut out, DATA, low, &image.data[position..position + len]);
        position += len;
    }

    push_record(&mut out, END_OF_FILE, 0, &[]);
    out
}

fn push_record(out: &mut String, kind: u8, address: u16, data: &[u8]) {
    let mut body = vec![data.len() as u8];
    body.extend_from_slice(&address.to_be_bytes());
    body.push(kind);
    body.extend_from_slice(data);
    let checksum = record_checksum(&body);

    out.push(':');
    for byte in body.iter().chain(std::iter::once(&checksum)) {
        let _ = write!(out, "{byte:02X}");
    }
    out.push('\n');
}

fn record_checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

fn hex_nibble(b: u8) -> Result<u8, ()> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_record() {
        let image = decode(b":03000000010203F7\n:00000001FF\n").unwrap();
        assert_eq!(image.base_address, 0);
        assert_eq!(image.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let image = decode(b"\r\n:03000000010203F7\r\n\r\n:00000001FF\r\n").unwrap();
        assert_eq!(image.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_lines_after_eof_are_ignored() {
        let image = decode(b":03000000010203F7\n:00000001FF\ngarbage").unwrap();
        assert_eq!(image.data.len(), 3);
    }

    #[test]
    fn test_checksum_mismatch() {
        let err = decode(b":03000000010203F8\n:00000001FF\n").unwrap_err();
        assert_eq!(
            err,
            HexError::Checksum {
                line: 1,
                stored: 0xF8,
                computed: 0xF7
            }
        );
    }

    #[test]
    fn test_gap_filled_with_erased_bytes() {
        let text = b":020000001122CB\n:02000400334483\n:00000001FF\n";
        let image = decode(text).unwrap();
        assert_eq!(image.data, vec![0x11, 0x22, 0xFF, 0xFF, 0x33, 0x44]);
    }

    #[test]
    fn test_extended_linear_address() {
        let text = b":020000040001F9\n:021000001122BB\n:00000001FF\n";
        let image = decode(text).unwrap();
        assert_eq!(image.base_address, 0x0001_1000);
        assert_eq!(image.data, vec![0x11, 0x22]);
    }

    #[test]
    fn test_extended_segment_address() {
        let text = b":020000021000EC\n:0100000055AA\n:00000001FF\n";
        let image = decode(text).unwrap();
        assert_eq!(image.base_address, 0x0001_0000);
        assert_eq!(image.data, vec![0x55]);
    }

    #[test]
    fn test_structural_errors() {
        let missing_eof = decode(b":03000000010203F7\n").unwrap_err();
        assert!(matches!(missing_eof, HexError::Format { ref details, .. } if details.contains("end-of-file")));

        let bad_digit = decode(b":0300000001020GF7\n:00000001FF\n").unwrap_err();
        assert!(matches!(bad_digit, HexError::Format { line: 1, .. }));

        let short = decode(b":04000000010203F6\n:00000001FF\n").unwrap_err();
        assert!(matches!(short, HexError::Format { ref details, .. } if details.contains("byte count")));

        let no_colon = decode(b"03000000010203F7\n").unwrap_err();
        assert!(matches!(no_colon, HexError::Format { line: 1, .. }));

        let unknown = decode(b":00000007F9\n:00000001FF\n").unwrap_err();
        assert!(matches!(unknown, HexError::Format { ref details, .. } if details.contains("unknown record type")));
    }

    #[test]
    fn test_image_size_limit() {
        let text = b":020000040100F9\n:0100000055AA\n:020000040000FA\n:0100000055AA\n:00000001FF\n";
        let err = decode_with_limit(text, 1024).unwrap_err();
        assert!(matches!(err, HexError::Format { line: 5, .. }));
    }

    #[test]
    fn test_encode_known_stream() {
        let image = FlatImage {
            base_address: 0,
            data: vec![1, 2, 3],
        };
        assert_eq!(encode(&image), ":03000000010203F7\n:00000001FF\n");
    }

    #[test]
    fn test_encode_decode_across_64k_boundary() {
        let image = FlatImage {
            base_address: 0xFFF8,
            data: (0..40u8).collect(),
        };
        let text = encode(&image);
        assert!(text.contains(":020000040001F9"));
        assert_eq!(decode(text.as_bytes()).unwrap(), image);
    }

    /// Same records as [`encode`], addressed through extended segment records
    fn encode_segmented(image: &FlatImage) -> String {
        let mut out = String::new();
        let mut segment: u16 = 0;
        let mut position = 0;

        while position < image.data.len() {
            let address = image.base_address as usize + position;
            let wanted = ((address >> 16) << 12) as u16;
            if wanted != segment {
                push_record(&mut out, EXTENDED_SEGMENT, 0, &wanted.to_be_bytes());
                segment = wanted;
            }
            let low = address & 0xFFFF;
            let len = RECORD_DATA_LEN.min(0x1_0000 - low).min(image.data.len() - position);
            push_record(&mut out, DATA, low as u16, &image.data[position..position + len]);
            position += len;
        }

        push_record(&mut out, END_OF_FILE, 0, &[]);
        out
    }

    #[test]
    fn test_round_trip_over_generated_images() {
        let bases = [0u32, 0x0F, 0xFFF0, 0xFFF8, 0xFFFF, 0x1_FFF1, 0x7_FFFE, 0xE_FFF9, 0x0800_FFF7];
        let lengths = [1usize, 15, 16, 17, 31, 33, 100, 300];

        for &base_address in &bases {
            for &len in &lengths {
                let image = FlatImage {
                    base_address,
                    data: (0..len).map(|i| (i as u8).wrapping_mul(37) ^ (base_address as u8)).collect(),
                };
                let end = base_address as u64 + len as u64;

                let linear = encode(&image);
                assert_eq!(decode(linear.as_bytes()).unwrap(), image, "linear {base_address:#x}+{len}");
                let first_half = (base_address >> 16) as u64;
                let crossings = ((end - 1) >> 16) - first_half;
                let expected = crossings as usize + usize::from(first_half != 0);
                assert_eq!(linear.matches(":02000004").count(), expected, "{base_address:#x}+{len}");

                // Segment addressing reaches the first MiB only
                if end <= 0x10_0000 {
                    let segmented = encode_segmented(&image);
                    assert_eq!(
                        decode(segmented.as_bytes()).unwrap(),
                        image,
                        "segmented {base_address:#x}+{len}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_empty_image() {
        let image = decode(b":00000001FF\n").unwrap();
        assert_eq!(image, FlatImage::default());
        assert_eq!(encode(&image), ":00000001FF\n");
    }
}
