//! Fat (multi-architecture) Mach-O slice selection.

use crate::error::{Error, Result};
use object::read::macho::{FatArch, MachOFatFile32, MachOFatFile64};
use object::Architecture;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, warn};

/// Architecture of the running host, as named by the `object` crate
pub fn native_architecture() -> Architecture {
    if cfg!(target_arch = "aarch64") {
        Architecture::Aarch64
    } else if cfg!(target_arch = "x86_64") {
        Architecture::X86_64
    } else if cfg!(target_arch = "x86") {
        Architecture::I386
    } else {
        Architecture::Unknown
    }
}

/// Picks the slice matching the host architecture, falling back to the first one.
///
/// `wide` selects the 64-bit fat header layout.
pub(crate) fn select_slice(path: &Path, data: &[u8], wide: bool) -> Result<Range<usize>> {
    let invalid = |e: object::read::Error| Error::format(path, format!("invalid fat header: {e}"));
    let slices: Vec<(Architecture, (u64, u64))> = if wide {
        MachOFatFile64::parse(data)
            .map_err(invalid)?
            .arches()
            .iter()
            .map(|arch| (arch.architecture(), arch.file_range()))
            .collect()
    } else {
        MachOFatFile32::parse(data)
            .map_err(invalid)?
            .arches()
            .iter()
            .map(|arch| (arch.architecture(), arch.file_range()))
            .collect()
    };

    let native = native_architecture();
    let (architecture, (offset, size)) = match slices.iter().find(|(arch, _)| *arch == native) {
        Some(slice) => *slice,
        None => {
            let first = slices
                .first()
                .ok_or_else(|| Error::format(path, "fat binary contains no slices"))?;
            warn!(
                "No {:?} slice in {}, using {:?} slice instead",
                native,
                path.display(),
                first.0
            );
            *first
        }
    };

    let end = offset
        .checked_add(size)
        .filter(|end| *end <= data.len() as u64)
        .ok_or_else(|| {
            Error::format(
                path,
                format!("{architecture:?} slice {offset:#x}+{size:#x} exceeds file size"),
            )
        })?;

    debug!(
        "Selected {:?} slice at {:#x}..{:#x} of {}",
        architecture,
        offset,
        end,
        path.display()
    );

    Ok(offset as usize..end as usize)
}
