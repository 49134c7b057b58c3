//! Record-level layout of the resource tables.
//!
//! All integers are big-endian. A tree record is:
//!
//! ```text
//! 0   u32  name offset (into the name table)
//! 4   u16  flags
//! 6        directory: u32 child count,  u32 first child index
//!          file:      u16 territory, u16 language, u32 data offset
//! 14  u64  last modified (layout version 2 and later only)
//! ```
//!
//! A name entry is `u16 length, u32 hash, length x UTF-16BE code units`.
//! A data entry is `u32 length, length bytes`.
//!
//! Decoding of every record kind lives in this module so that a new layout
//! only touches [`TreeLayout::decode_record`].

use crate::error::{Error, Result};

/// Record flag: payload is zlib-compressed with a 4-byte size prefix
pub const FLAG_COMPRESSED: u16 = 0x01;
/// Record flag: record is a directory
pub const FLAG_DIRECTORY: u16 = 0x02;
/// Record flag: payload is a zstd frame
pub const FLAG_COMPRESSED_ZSTD: u16 = 0x04;

/// Size of a name entry header (length + hash)
pub const NAME_HEADER_LEN: usize = 6;
/// Size of a data entry header (length)
pub const DATA_HEADER_LEN: usize = 4;

/// A candidate tree record layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLayout {
    /// Resource format version the layout belongs to
    pub version: u8,
    /// Width of one tree record in bytes
    pub record_width: usize,
}

impl TreeLayout {
    /// Version 1: no modification timestamps
    pub const V1: TreeLayout = TreeLayout {
        version: 1,
        record_width: 14,
    };

    /// Versions 2 and 3: records carry a 64-bit modification timestamp
    pub const V2: TreeLayout = TreeLayout {
        version: 2,
        record_width: 22,
    };

    /// Layouts probed when the version is not known in advance
    pub const CANDIDATES: [TreeLayout; 2] = [TreeLayout::V1, TreeLayout::V2];

    fn has_timestamp(&self) -> bool {
        self.version >= 2
    }

    /// Byte offset of record `index` in the tree table
    pub fn record_offset(&self, index: usize) -> usize {
        index * self.record_width
    }

    /// Number of whole records that fit in `tree_len` bytes
    pub fn record_capacity(&self, tree_len: usize) -> usize {
        tree_len / self.record_width
    }

    /// Decodes tree record `index`
    pub fn decode_record(&self, tree: &[u8], index: usize) -> Result<RawRecord> {
        let offset = self.record_offset(index);
        let record = tree
            .get(offset..offset + self.record_width)
            .ok_or_else(|| {
                Error::malformed_tree(
                    "tree",
                    offset,
                    format!("record {index} extends past tree table ({} bytes)", tree.len()),
                )
            })?;

        let name_offset = be_u32(record, 0);
        let flags = be_u16(record, 4);

        if flags & FLAG_DIRECTORY != 0 {
            return Ok(RawRecord::Directory {
                name_offset,
                child_count: be_u32(record, 6),
                first_child: be_u32(record, 10),
            });
        }

        let compression = if flags & FLAG_COMPRESSED != 0 {
            Compression::Zlib
        } else if flags & FLAG_COMPRESSED_ZSTD != 0 {
            Compression::Zstd
        } else {
            Compression::None
        };

        Ok(RawRecord::File {
            name_offset,
            compression,
            territory: be_u16(record, 6),
            language: be_u16(record, 8),
            data_offset: be_u32(record, 10),
            last_modified: self.has_timestamp().then(|| be_u64(record, 14)),
        })
    }
}

/// Payload compression declared by a file record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Stored as-is
    None,
    /// zlib stream behind a 4-byte big-endian uncompressed size
    Zlib,
    /// zstd frame
    Zstd,
}

impl Compression {
    /// Returns a short display name
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "stored",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
        }
    }

    /// Returns true for any compressed payload
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }
}

/// A tree record before names and payloads are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawRecord {
    /// Directory record
    Directory {
        /// Offset of the name entry
        name_offset: u32,
        /// Number of consecutive child records
        child_count: u32,
        /// Index of the first child record
        first_child: u32,
    },
    /// File record
    File {
        /// Offset of the name entry
        name_offset: u32,
        /// Payload compression
        compression: Compression,
        /// Locale territory code
        territory: u16,
        /// Locale language code
        language: u16,
        /// Offset of the data entry
        data_offset: u32,
        /// Milliseconds since the epoch, layout version 2 and later
        last_modified: Option<u64>,
    },
}

/// The name hash stored in every name entry
pub fn name_hash(units: impl IntoIterator<Item = u16>) -> u32 {
    let mut hash: u32 = 0;
    for unit in units {
        hash = (hash << 4).wrapping_add(unit as u32);
        hash ^= (hash & 0xf000_0000) >> 23;
        hash &= 0x0fff_ffff;
    }
    hash
}

/// Encodes `name` as a name entry (header + UTF-16BE)
pub fn encode_name(name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let mut out = Vec::with_capacity(NAME_HEADER_LEN + units.len() * 2);
    out.extend_from_slice(&(units.len() as u16).to_be_bytes());
    out.extend_from_slice(&name_hash(units.iter().copied()).to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// A decoded name entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    /// The decoded name
    pub name: String,
    /// Total size of the entry including its header
    pub encoded_len: usize,
}

/// Decodes and hash-verifies the name entry at `offset`
pub fn decode_name(names: &[u8], offset: usize) -> Result<NameEntry> {
    let header = names
        .get(offset..offset + NAME_HEADER_LEN)
        .ok_or_else(|| Error::malformed_tree("names", offset, "name entry header out of range"))?;
    let length = be_u16(header, 0) as usize;
    let hash = be_u32(header, 2);

    let start = offset + NAME_HEADER_LEN;
    let raw = names
        .get(start..start + length * 2)
        .ok_or_else(|| Error::malformed_tree("names", offset, format!("name of {length} units out of range")))?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    let computed = name_hash(units.iter().copied());
    if computed != hash {
        return Err(Error::malformed_tree(
            "names",
            offset,
            format!("name hash mismatch: stored {hash:#010x}, computed {computed:#010x}"),
        ));
    }

    let name = String::from_utf16(&units)
        .map_err(|_| Error::malformed_tree("names", offset, "name is not valid UTF-16"))?;

    Ok(NameEntry {
        name,
        encoded_len: NAME_HEADER_LEN + length * 2,
    })
}

/// Reads the length prefix of the data entry at `offset`
pub fn data_entry_len(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + DATA_HEADER_LEN).map(|b| be_u32(b, 0))
}

fn be_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

pub(crate) fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_known_value() {
        assert_eq!(name_hash("fwusb".encode_utf16()), 0x006D_EC92);
        assert_eq!(name_hash("".encode_utf16()), 0);
    }

    #[test]
    fn test_name_entry_encoding() {
        let entry = encode_name("fwusb");
        assert_eq!(&entry[..6], &[0x00, 0x05, 0x00, 0x6D, 0xEC, 0x92]);
        assert_eq!(&entry[6..8], &[0x00, b'f']);

        let decoded = decode_name(&entry, 0).unwrap();
        assert_eq!(decoded.name, "fwusb");
        assert_eq!(decoded.encoded_len, 16);
    }

    #[test]
    fn test_name_hash_mismatch() {
        let mut entry = encode_name("fwfpga");
        entry[5] ^= 0x01;
        let err = decode_name(&entry, 0).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_name_out_of_range() {
        let entry = encode_name("fwusb");
        assert!(decode_name(&entry[..10], 0).is_err());
        assert!(decode_name(&entry, 12).is_err());
    }

    #[test]
    fn test_decode_directory_record() {
        let mut tree = vec![0u8; 14];
        tree[4..6].copy_from_slice(&FLAG_DIRECTORY.to_be_bytes());
        tree[6..10].copy_from_slice(&3u32.to_be_bytes());
        tree[10..14].copy_from_slice(&1u32.to_be_bytes());

        assert_eq!(
            TreeLayout::V1.decode_record(&tree, 0).unwrap(),
            RawRecord::Directory {
                name_offset: 0,
                child_count: 3,
                first_child: 1
            }
        );
        assert!(TreeLayout::V2.decode_record(&tree, 0).is_err());
    }

    #[test]
    fn test_decode_file_record_with_timestamp() {
        let mut tree = vec![0u8; 44];
        let rec = &mut tree[22..];
        rec[0..4].copy_from_slice(&0x10u32.to_be_bytes());
        rec[4..6].copy_from_slice(&FLAG_COMPRESSED.to_be_bytes());
        rec[6..8].copy_from_slice(&1u16.to_be_bytes());
        rec[8..10].copy_from_slice(&2u16.to_be_bytes());
        rec[10..14].copy_from_slice(&0x40u32.to_be_bytes());
        rec[14..22].copy_from_slice(&1_700_000_000_000u64.to_be_bytes());

        assert_eq!(
            TreeLayout::V2.decode_record(&tree, 1).unwrap(),
            RawRecord::File {
                name_offset: 0x10,
                compression: Compression::Zlib,
                territory: 1,
                language: 2,
                data_offset: 0x40,
                last_modified: Some(1_700_000_000_000),
            }
        );
    }

    #[test]
    fn test_data_entry_len() {
        let data = [0x00, 0x00, 0x01, 0x00, 0xAA];
        assert_eq!(data_entry_len(&data, 0), Some(256));
        assert_eq!(data_entry_len(&data, 2), None);
    }
}
