//! Container loader.
//!
//! Identifies the executable container by its leading magic bytes and
//! exposes a uniform view of it: a list of [`Section`]s with file offsets,
//! plus any resource-compiler symbol triples ([`ResourceSymbols`]) found in
//! the symbol table.
//!
//! ## Supported containers
//!
//! - ELF (32/64-bit), usually unstripped: the three resource tables are
//!   delimited by symbols.
//! - Mach-O (32/64-bit), thin or fat. Fat files are narrowed to the slice
//!   matching the host architecture. Release builds are stripped, so the
//!   resource tables are later recovered from `__TEXT,__const` by scanning.
//!
//! Section offsets are always absolute within the input file, including for
//! slices of a fat binary.

mod macho;
mod symbols;

use crate::error::{Error, Result};
use object::{Architecture, FileKind, Object, ObjectSection, SectionIndex};
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub use macho::native_architecture;
pub use symbols::{ResourceSymbols, SymbolRange, DATA_SYMBOL, NAMES_SYMBOL, TREE_SYMBOL};

/// Executable container kinds understood by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// ELF object or executable
    Elf,
    /// Mach-O image (thin, or a slice of a fat binary)
    MachO,
}

impl ContainerFormat {
    /// Returns a short display name
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Elf => "ELF",
            ContainerFormat::MachO => "Mach-O",
        }
    }

    /// The `(segment, section)` pair holding constant data for this format
    pub fn const_section(&self) -> (Option<&'static str>, &'static str) {
        match self {
            ContainerFormat::Elf => (None, ".rodata"),
            ContainerFormat::MachO => (Some("__TEXT"), "__const"),
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A section with file-backed contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name (`.rodata`, `__const`, ...)
    pub name: String,
    /// Owning segment name, Mach-O only
    pub segment: Option<String>,
    /// Absolute offset of the section contents in the input file
    pub file_offset: u64,
    /// Size of the file-backed contents
    pub size: u64,
    /// Address the section is mapped at
    pub virtual_address: u64,
}

impl Section {
    /// Byte range of the section contents within the input file
    pub fn file_range(&self) -> Range<usize> {
        self.file_offset as usize..(self.file_offset + self.size) as usize
    }

    fn matches(&self, segment: Option<&str>, name: &str) -> bool {
        self.name == name && (segment.is_none() || self.segment.as_deref() == segment)
    }
}

/// A loaded executable. Immutable once constructed.
#[derive(Debug)]
pub struct BinaryImage {
    path: PathBuf,
    format: ContainerFormat,
    architecture: Architecture,
    data: Vec<u8>,
    sections: Vec<Section>,
    resource_symbols: Vec<ResourceSymbols>,
}

impl BinaryImage {
    /// Reads and parses the binary at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        trace!("Reading {}", path.display());
        let data = std::fs::read(path).map_err(|e| Error::file_read(path, e))?;
        Self::parse(path, data)
    }

    /// Parses an in-memory binary; `path` is only used for diagnostics
    pub fn parse(path: impl Into<PathBuf>, data: Vec<u8>) -> Result<Self> {
        let path = path.into();

        let kind = FileKind::parse(data.as_slice()).map_err(|_| {
            Error::format(&path, format!("unrecognized magic {}", leading_bytes(&data)))
        })?;

        let (format, slice) = match kind {
            FileKind::Elf32 | FileKind::Elf64 => (ContainerFormat::Elf, 0..data.len()),
            FileKind::MachO32 | FileKind::MachO64 => (ContainerFormat::MachO, 0..data.len()),
            FileKind::MachOFat32 => (ContainerFormat::MachO, macho::select_slice(&path, &data, false)?),
            FileKind::MachOFat64 => (ContainerFormat::MachO, macho::select_slice(&path, &data, true)?),
            other => {
                return Err(Error::format(
                    &path,
                    format!("unsupported container kind {other:?}"),
                ))
            }
        };

        let parsed = parse_slice(&path, &data[slice.clone()], slice.start as u64)?;

        debug!(
            "Loaded {} ({}, {:?}): {} sections, {} resource symbol set(s)",
            path.display(),
            format,
            parsed.architecture,
            parsed.sections.len(),
            parsed.resource_symbols.len()
        );

        Ok(Self {
            path,
            format,
            architecture: parsed.architecture,
            data,
            sections: parsed.sections,
            resource_symbols: parsed.resource_symbols,
        })
    }

    /// Path the image was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Container format of the selected image
    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// Architecture of the selected image
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// File-backed sections in header order
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Resource symbol triples, one per registered resource bundle
    pub fn resource_symbols(&self) -> &[ResourceSymbols] {
        &self.resource_symbols
    }

    /// Finds a section by segment and name
    pub fn section(&self, segment: Option<&str>, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.matches(segment, name))
    }

    /// The constant-data section scanned when no resource symbols are present
    pub fn const_section(&self) -> Option<&Section> {
        let (segment, name) = self.format.const_section();
        self.section(segment, name)
    }

    /// Bounds-checked view of `size` bytes at absolute file offset `offset`
    pub fn bytes(&self, offset: u64, size: u64) -> Result<&[u8]> {
        let start = usize::try_from(offset).ok();
        let end = offset.checked_add(size).and_then(|e| usize::try_from(e).ok());
        match (start, end) {
            (Some(start), Some(end)) if end <= self.data.len() => Ok(&self.data[start..end]),
            _ => Err(Error::format(
                &self.path,
                format!(
                    "range {offset:#x}+{size:#x} exceeds file size {:#x}",
                    self.data.len()
                ),
            )),
        }
    }

    /// Contents of a section
    pub fn section_data(&self, section: &Section) -> Result<&[u8]> {
        self.bytes(section.file_offset, section.size)
    }
}

struct ParsedSlice {
    architecture: Architecture,
    sections: Vec<Section>,
    resource_symbols: Vec<ResourceSymbols>,
}

fn parse_slice(path: &Path, bytes: &[u8], base: u64) -> Result<ParsedSlice> {
    let file = object::File::parse(bytes)
        .map_err(|e| Error::format(path, format!("truncated or invalid headers: {e}")))?;

    let mut sections = Vec::new();
    let mut positions: HashMap<SectionIndex, usize> = HashMap::new();

    for section in file.sections() {
        let Some((offset, size)) = section.file_range() else {
            continue;
        };
        if offset.saturating_add(size) > bytes.len() as u64 {
            return Err(Error::format(
                path,
                format!(
                    "section {} extends past end of image ({offset:#x}+{size:#x})",
                    section.name().unwrap_or("?")
                ),
            ));
        }

        positions.insert(section.index(), sections.len());
        sections.push(Section {
            name: section.name().unwrap_or_default().to_string(),
            segment: section.segment_name().ok().flatten().map(str::to_string),
            file_offset: base + offset,
            size,
            virtual_address: section.address(),
        });
    }

    let resource_symbols = symbols::resolve(&file, &sections, &positions);

    Ok(ParsedSlice {
        architecture: file.architecture(),
        sections,
        resource_symbols,
    })
}

fn leading_bytes(data: &[u8]) -> String {
    let shown = &data[..data.len().min(4)];
    if shown.is_empty() {
        return "(empty file)".to_string();
    }
    shown.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognized_magic() {
        let err = BinaryImage::parse("junk.bin", b"PK\x03\x04 not an executable".to_vec())
            .unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(err.to_string().contains("50 4b 03 04"));
    }

    #[test]
    fn test_empty_file() {
        let err = BinaryImage::parse("empty", Vec::new()).unwrap_err();
        assert!(err.to_string().contains("empty file"));
    }

    #[test]
    fn test_truncated_elf_header() {
        let mut data = b"\x7fELF\x02\x01\x01".to_vec();
        data.resize(20, 0);
        let err = BinaryImage::parse("short.elf", data).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn test_const_section_names() {
        assert_eq!(ContainerFormat::MachO.const_section(), (Some("__TEXT"), "__const"));
        assert_eq!(ContainerFormat::Elf.const_section(), (None, ".rodata"));
    }

    #[test]
    fn test_section_matching() {
        let section = Section {
            name: "__const".into(),
            segment: Some("__TEXT".into()),
            file_offset: 0x100,
            size: 0x20,
            virtual_address: 0x1000,
        };
        assert!(section.matches(Some("__TEXT"), "__const"));
        assert!(section.matches(None, "__const"));
        assert!(!section.matches(Some("__DATA"), "__const"));
        assert_eq!(section.file_range(), 0x100..0x120);
    }
}
