//! Firmware mapping tables.
//!
//! A [`MappingTable`] associates resource tree paths with the file names a
//! consuming driver expects. Tables are plain values built once and passed
//! to the extractor; [`MappingTable::for_scheme`] returns the built-in ones.

use crate::error::{Error, Result};
use crate::tree::{ResourceFile, ResourceTree};
use std::fmt;

/// Expected content of a mapped resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Microcontroller firmware stored as hex text
    McuHex,
    /// FPGA configuration bitstream, opaque
    FpgaBlob,
}

impl PayloadKind {
    /// Returns a short display name
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::McuHex => "mcu-hex",
            PayloadKind::FpgaBlob => "fpga-blob",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Output naming convention
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NamingScheme {
    /// Names loaded by the sigrok `kingst-la2016` driver
    #[default]
    Sigrok,
    /// Stored hex text of the MCU images, kept verbatim as `fw01A1.hex` etc.
    Legacy,
}

impl NamingScheme {
    /// Returns the scheme name
    pub fn as_str(&self) -> &'static str {
        match self {
            NamingScheme::Sigrok => "sigrok",
            NamingScheme::Legacy => "legacy",
        }
    }
}

impl fmt::Display for NamingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One resource to extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareMapping {
    /// `/`-separated path in the resource tree
    pub tree_path: String,
    /// Device family the image belongs to
    pub device_family: String,
    /// Hardware revision the image belongs to
    pub hardware_revision: String,
    /// File name in the output directory
    pub output_filename: String,
    /// What the resource should contain
    pub expected_kind: PayloadKind,
    /// Write the stored hex text as-is rather than the flat image
    pub verbatim: bool,
}

impl FirmwareMapping {
    /// Creates a new mapping entry
    pub fn new(
        tree_path: impl Into<String>,
        device_family: impl Into<String>,
        hardware_revision: impl Into<String>,
        output_filename: impl Into<String>,
        expected_kind: PayloadKind,
    ) -> Self {
        Self {
            tree_path: tree_path.into(),
            device_family: device_family.into(),
            hardware_revision: hardware_revision.into(),
            output_filename: output_filename.into(),
            expected_kind,
            verbatim: false,
        }
    }

    /// Keeps the stored hex text instead of transcoding it
    pub fn verbatim(mut self) -> Self {
        self.verbatim = true;
        self
    }

    /// Walks `tree` along this entry's path, matching names case-sensitively
    pub fn locate<'t>(&self, tree: &'t ResourceTree) -> Result<&'t ResourceFile> {
        tree.find_file(&self.tree_path)
            .ok_or_else(|| Error::not_found_in_tree(&self.tree_path))
    }
}

const MCU_REVISIONS: [&str; 4] = ["01A1", "01A2", "01A3", "01A4"];

// (tree name, family, revision, sigrok output name)
const FPGA_IMAGES: [(&str, &str, &str, &str); 7] = [
    ("LA2016A", "LA2016", "A1", "kingst-la2016a1-fpga.bitstream"),
    ("LA2016", "LA2016", "base", "kingst-la2016-fpga.bitstream"),
    ("LA1016A", "LA1016", "A1", "kingst-la1016a1-fpga.bitstream"),
    ("LA1016", "LA1016", "base", "kingst-la1016-fpga.bitstream"),
    ("LA5016A", "LA5016", "A1", "kingst-la5016a1-fpga.bitstream"),
    ("LA5032A", "LA5032", "A0", "kingst-la5032a0-fpga.bitstream"),
    ("MS6218", "MS6218", "base", "kingst-ms6218-fpga.bitstream"),
];

/// An ordered, read-only set of mapping entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    entries: Vec<FirmwareMapping>,
}

impl MappingTable {
    /// Creates a table from custom entries
    pub fn new(entries: Vec<FirmwareMapping>) -> Self {
        Self { entries }
    }

    /// The built-in table for a naming scheme
    pub fn for_scheme(scheme: NamingScheme) -> Self {
        match scheme {
            NamingScheme::Sigrok => Self::sigrok(),
            NamingScheme::Legacy => Self::legacy(),
        }
    }

    /// MCU firmware and FPGA bitstreams under the sigrok driver's names
    pub fn sigrok() -> Self {
        let mcu = MCU_REVISIONS.iter().map(|rev| {
            FirmwareMapping::new(
                format!("fwusb/fw{rev}.hex"),
                "LA1010",
                *rev,
                format!("kingst-la-{}.fw", rev.to_ascii_lowercase()),
                PayloadKind::McuHex,
            )
        });
        let fpga = FPGA_IMAGES.iter().map(|(name, family, rev, output)| {
            FirmwareMapping::new(
                format!("fwfpga/{name}"),
                *family,
                *rev,
                *output,
                PayloadKind::FpgaBlob,
            )
        });
        Self::new(mcu.chain(fpga).collect())
    }

    /// MCU firmware as validated hex text under its tree name
    pub fn legacy() -> Self {
        Self::new(
            MCU_REVISIONS
                .iter()
                .map(|rev| {
                    FirmwareMapping::new(
                        format!("fwusb/fw{rev}.hex"),
                        "LA1010",
                        *rev,
                        format!("fw{rev}.hex"),
                        PayloadKind::McuHex,
                    )
                    .verbatim()
                })
                .collect(),
        )
    }

    /// Entries in table order
    pub fn entries(&self) -> &[FirmwareMapping] {
        &self.entries
    }

    /// Iterates over the entries
    pub fn iter(&self) -> std::slice::Iter<'_, FirmwareMapping> {
        self.entries.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a MappingTable {
    type Item = &'a FirmwareMapping;
    type IntoIter = std::slice::Iter<'a, FirmwareMapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_sigrok_names() {
        let table = MappingTable::for_scheme(NamingScheme::Sigrok);
        assert_eq!(table.len(), 11);

        let first = &table.entries()[0];
        assert_eq!(first.tree_path, "fwusb/fw01A1.hex");
        assert_eq!(first.output_filename, "kingst-la-01a1.fw");
        assert_eq!(first.expected_kind, PayloadKind::McuHex);

        let la5032 = table
            .iter()
            .find(|m| m.tree_path == "fwfpga/LA5032A")
            .unwrap();
        assert_eq!(la5032.output_filename, "kingst-la5032a0-fpga.bitstream");
        assert_eq!(la5032.expected_kind, PayloadKind::FpgaBlob);
    }

    #[test]
    fn test_legacy_names() {
        let table = MappingTable::legacy();
        let names: Vec<&str> = table.iter().map(|m| m.output_filename.as_str()).collect();
        assert_eq!(names, ["fw01A1.hex", "fw01A2.hex", "fw01A3.hex", "fw01A4.hex"]);
        assert!(table.iter().all(|m| m.verbatim));
        assert!(MappingTable::sigrok().iter().all(|m| !m.verbatim));
    }

    #[test]
    fn test_output_names_are_unique_and_flat() {
        for scheme in [NamingScheme::Sigrok, NamingScheme::Legacy] {
            let table = MappingTable::for_scheme(scheme);
            let unique: HashSet<&str> = table.iter().map(|m| m.output_filename.as_str()).collect();
            assert_eq!(unique.len(), table.len(), "{scheme}");
            assert!(table.iter().all(|m| !m.output_filename.contains('/')));
        }
    }

    #[test]
    fn test_default_scheme() {
        assert_eq!(NamingScheme::default(), NamingScheme::Sigrok);
        assert_eq!(PayloadKind::FpgaBlob.to_string(), "fpga-blob");
    }
}
