//! Payload decoding.
//!
//! Reads a file node's stored bytes from the data table, inflates them when
//! the record is compressed, and transcodes hex-text firmware to a flat
//! binary image. Anything else is passed through as an opaque blob.

pub mod ihex;

use crate::error::{Error, Result};
use crate::mapping::PayloadKind;
use crate::tree::{Compression, ResourceFile};
use flate2::read::ZlibDecoder;
use std::io::Read;
use tracing::{debug, warn};

pub use ihex::{FlatImage, HexError};

/// Size of the big-endian length prefix ahead of a zlib stream
const ZLIB_SIZE_PREFIX: usize = 4;

/// A decoded payload ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    /// Output bytes
    pub bytes: Vec<u8>,
    /// What the content turned out to be
    pub kind: PayloadKind,
    /// Load address of a transcoded hex image
    pub load_address: Option<u32>,
}

/// Reads, inflates and transcodes the payload of `file`.
///
/// `entry` is the tree path, used in errors and logs.
pub fn decode(data: &[u8], file: &ResourceFile, entry: &str, expected: PayloadKind) -> Result<DecodedPayload> {
    let raw = read(data, file, entry)?;
    transcode(raw, expected, entry)
}

/// Returns the stored payload of `file`, inflated when compressed
pub fn read(data: &[u8], file: &ResourceFile, entry: &str) -> Result<Vec<u8>> {
    let offset = file.data_offset as usize;
    let stored = data.get(file.payload_range()).ok_or_else(|| {
        Error::payload_corrupt(
            entry,
            offset,
            format!("{} bytes overrun the data table ({} bytes)", file.data_size, data.len()),
        )
    })?;

    match file.compression {
        Compression::None => Ok(stored.to_vec()),
        Compression::Zlib => inflate_zlib(stored, entry, offset),
        Compression::Zstd => inflate_zstd(stored, entry, offset),
    }
}

fn inflate_zlib(stored: &[u8], entry: &str, offset: usize) -> Result<Vec<u8>> {
    if stored.len() < ZLIB_SIZE_PREFIX {
        return Err(Error::payload_corrupt(
            entry,
            offset,
            format!("{} bytes cannot hold the size prefix", stored.len()),
        ));
    }
    let (prefix, stream) = stored.split_at(ZLIB_SIZE_PREFIX);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    // One byte past the declared size is enough to detect an overlong stream
    let mut out = Vec::with_capacity(declared.min(ihex::MAX_IMAGE_SIZE));
    ZlibDecoder::new(stream)
        .take(declared as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::payload_corrupt(entry, offset, format!("zlib stream: {e}")))?;

    if out.len() != declared {
        return Err(Error::payload_corrupt(
            entry,
            offset,
            format!("inflated to {} bytes, declared {declared}", out.len()),
        ));
    }
    debug!("Inflated '{}': {} -> {} bytes", entry, stored.len(), out.len());
    Ok(out)
}

#[cfg(feature = "zstd")]
fn inflate_zstd(stored: &[u8], entry: &str, offset: usize) -> Result<Vec<u8>> {
    let out = zstd::decode_all(stored)
        .map_err(|e| Error::payload_corrupt(entry, offset, format!("zstd frame: {e}")))?;
    debug!("Inflated '{}' (zstd): {} -> {} bytes", entry, stored.len(), out.len());
    Ok(out)
}

#[cfg(not(feature = "zstd"))]
fn inflate_zstd(_stored: &[u8], entry: &str, offset: usize) -> Result<Vec<u8>> {
    Err(Error::payload_corrupt(
        entry,
        offset,
        "zstd-compressed payload; rebuild with the `zstd` feature",
    ))
}

/// Converts hex text to a flat image, passing blobs through.
///
/// Content starting with `:` is parsed as hex. A checksum failure is an
/// error. Content that is not structurally hex text is passed through as a
/// blob whatever `expected` says, with a warning when hex was expected.
pub fn transcode(raw: Vec<u8>, expected: PayloadKind, entry: &str) -> Result<DecodedPayload> {
    if raw.first() != Some(&b':') {
        if expected == PayloadKind::McuHex {
            warn!("'{}' was expected to be hex text but is binary; passing it through", entry);
        }
        return Ok(blob(raw));
    }

    match ihex::decode(&raw) {
        Ok(image) => {
            if expected == PayloadKind::FpgaBlob {
                warn!("'{}' was expected to be an FPGA blob but is hex text; transcoding it", entry);
            }
            debug!(
                "Transcoded '{}': {} hex bytes -> {} bytes at {:#x}",
                entry,
                raw.len(),
                image.data.len(),
                image.base_address
            );
            Ok(DecodedPayload {
                bytes: image.data,
                kind: PayloadKind::McuHex,
                load_address: Some(image.base_address),
            })
        }
        Err(HexError::Format { line, details }) => {
            if expected == PayloadKind::McuHex {
                warn!(
                    "'{}' was expected to be hex text but is not ({} at line {}); passing it through",
                    entry, details, line
                );
            } else {
                debug!("'{}' is not hex text ({} at line {}); passing it through", entry, details, line);
            }
            Ok(blob(raw))
        }
        Err(e) => Err(hex_error(e, entry)),
    }
}

/// Validates hex text and keeps it as-is instead of flattening it.
///
/// Any hex error, including a structural one, is an error here.
pub fn verify_hex(raw: Vec<u8>, entry: &str) -> Result<DecodedPayload> {
    let image = ihex::decode(&raw).map_err(|e| hex_error(e, entry))?;
    debug!(
        "Verified '{}': {} hex bytes for {} bytes at {:#x}",
        entry,
        raw.len(),
        image.data.len(),
        image.base_address
    );
    Ok(DecodedPayload {
        bytes: raw,
        kind: PayloadKind::McuHex,
        load_address: Some(image.base_address),
    })
}

fn blob(bytes: Vec<u8>) -> DecodedPayload {
    DecodedPayload {
        bytes,
        kind: PayloadKind::FpgaBlob,
        load_address: None,
    }
}

fn hex_error(error: HexError, entry: &str) -> Error {
    match error {
        HexError::Checksum {
            line,
            stored,
            computed,
        } => Error::HexChecksum {
            entry: entry.to_string(),
            line,
            stored,
            computed,
        },
        HexError::Format { line, details } => Error::HexFormat {
            entry: entry.to_string(),
            line,
            details,
        },
    }
}
