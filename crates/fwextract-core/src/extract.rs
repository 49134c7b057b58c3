//! The extraction pipeline.
//!
//! Loader -> locator -> tree decoder, once per run, then for every mapping
//! entry: tree lookup -> payload transcoding -> atomic write. Failures up to
//! the tree decode abort the run; failures of a single entry are recorded in
//! its [`ExtractionResult`] and the next entry proceeds.

use crate::container::BinaryImage;
use crate::error::{Error, Result};
use crate::locator::{self, LocatorConfig, TableOrigin};
use crate::mapping::{FirmwareMapping, MappingTable, PayloadKind};
use crate::output::OutputDir;
use crate::payload;
use crate::tree::{self, ResourceFile, ResourceTree};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Run options
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Locator tunables
    pub locator: LocatorConfig,
    /// Decode every entry but write nothing
    pub dry_run: bool,
}

impl ExtractOptions {
    /// Creates options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the locator tunables
    pub fn locator(mut self, config: LocatorConfig) -> Self {
        self.locator = config;
        self
    }

    /// Enables or disables dry-run mode
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A decoded resource bundle, detached from the binary it came from
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    /// The decoded tree
    pub tree: ResourceTree,
    /// Copy of the bundle's data table
    pub data: Vec<u8>,
    /// Where the tables were found in the binary
    pub origin: TableOrigin,
}

impl ResourceBundle {
    /// Stored, inflated bytes of a file of this bundle
    pub fn read(&self, path: &str, file: &ResourceFile) -> Result<Vec<u8>> {
        payload::read(&self.data, file, path)
    }
}

/// What happened to one mapping entry
#[derive(Debug)]
pub enum EntryOutcome {
    /// Decoded and written
    Written {
        /// Final output path
        path: PathBuf,
        /// Bytes written
        size: usize,
        /// Content kind found
        kind: PayloadKind,
        /// BLAKE3 digest of the written bytes, lowercase hex
        digest: String,
    },
    /// Decoded; nothing written in dry-run mode
    DryRun {
        /// Bytes that would be written
        size: usize,
        /// Content kind found
        kind: PayloadKind,
    },
    /// The tree path does not exist in any bundle
    NotFoundInTree,
    /// The payload could not be decoded
    DecodeError(Error),
    /// The decoded payload could not be written
    WriteError(Error),
}

impl EntryOutcome {
    /// Returns true for written (or, in dry-run mode, decoded) entries
    pub fn is_success(&self) -> bool {
        matches!(self, EntryOutcome::Written { .. } | EntryOutcome::DryRun { .. })
    }
}

/// The outcome for one mapping entry
#[derive(Debug)]
pub struct ExtractionResult {
    /// The mapping entry
    pub mapping: FirmwareMapping,
    /// What happened to it
    pub outcome: EntryOutcome,
}

/// Terminal output of a run
#[derive(Debug)]
pub struct ExtractionReport {
    /// Destination directory; `None` in dry-run mode
    pub output_dir: Option<PathBuf>,
    /// Number of resource bundles decoded
    pub bundle_count: usize,
    /// One result per mapping entry, in table order
    pub results: Vec<ExtractionResult>,
}

impl ExtractionReport {
    /// Entries written (or decoded, in dry-run mode)
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_success()).count()
    }

    /// Entries that failed for any reason
    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    /// Returns true if no entry succeeded
    pub fn all_failed(&self) -> bool {
        self.success_count() == 0
    }
}

/// Loads `binary`, locates its resource bundles and decodes their trees.
///
/// Bundles whose tree fails to decode are skipped with a warning; the run
/// fails only if none decodes.
pub fn open_bundles(binary: impl AsRef<Path>, config: &LocatorConfig) -> Result<Vec<ResourceBundle>> {
    let image = BinaryImage::load(binary)?;
    let tables = locator::locate(&image, config)?;

    let mut bundles = Vec::with_capacity(tables.len());
    let mut first_error = None;

    for (index, table) in tables.iter().enumerate() {
        match tree::decode(table, config.tree_limits) {
            Ok(tree) => {
                debug!(
                    "Bundle {}: {} records, {} files (tree at {:#x})",
                    index,
                    tree.record_count(),
                    tree.files().len(),
                    table.origin.tree
                );
                bundles.push(ResourceBundle {
                    tree,
                    data: table.data.to_vec(),
                    origin: table.origin,
                });
            }
            Err(e) => {
                let e = e.in_binary(image.path());
                warn!("Skipping bundle {} (tree at {:#x}): {}", index, table.origin.tree, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match (bundles.is_empty(), first_error) {
        (true, Some(e)) => Err(e),
        _ => {
            info!(
                "Decoded {} resource bundle(s) from {}",
                bundles.len(),
                image.path().display()
            );
            Ok(bundles)
        }
    }
}

/// Finds `mapping` in the bundles; the first bundle holding the path wins
pub fn find_file<'b>(
    bundles: &'b [ResourceBundle],
    mapping: &FirmwareMapping,
) -> Option<(&'b ResourceBundle, &'b ResourceFile)> {
    bundles
        .iter()
        .find_map(|bundle| mapping.locate(&bundle.tree).ok().map(|file| (bundle, file)))
}

/// Extracts every entry of `table` from `binary` into `output`.
///
/// The output directory is only created once the tree has been decoded, so
/// a run that fails early leaves the file system untouched.
pub fn extract(
    binary: impl AsRef<Path>,
    output: impl AsRef<Path>,
    table: &MappingTable,
    options: &ExtractOptions,
) -> Result<ExtractionReport> {
    let bundles = open_bundles(binary, &options.locator)?;

    let out = if options.dry_run {
        None
    } else {
        Some(OutputDir::acquire(output.as_ref())?)
    };

    let results = table
        .iter()
        .map(|mapping| ExtractionResult {
            mapping: mapping.clone(),
            outcome: extract_entry(&bundles, mapping, out.as_ref()),
        })
        .collect();

    Ok(ExtractionReport {
        output_dir: out.map(|dir| dir.path().to_path_buf()),
        bundle_count: bundles.len(),
        results,
    })
}

fn extract_entry(
    bundles: &[ResourceBundle],
    mapping: &FirmwareMapping,
    out: Option<&OutputDir>,
) -> EntryOutcome {
    let Some((bundle, file)) = find_file(bundles, mapping) else {
        info!("{} not present in the resource tree", mapping.tree_path);
        return EntryOutcome::NotFoundInTree;
    };

    let entry = mapping.tree_path.as_str();
    let decoded = if mapping.verbatim {
        payload::read(&bundle.data, file, entry).and_then(|raw| payload::verify_hex(raw, entry))
    } else {
        payload::decode(&bundle.data, file, entry, mapping.expected_kind)
    };
    let decoded = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("{}: {}", mapping.tree_path, e);
            return EntryOutcome::DecodeError(e);
        }
    };
    let size = decoded.bytes.len();

    let Some(dir) = out else {
        info!("{} -> {} ({} bytes, dry run)", mapping.tree_path, mapping.output_filename, size);
        return EntryOutcome::DryRun {
            size,
            kind: decoded.kind,
        };
    };

    match dir.write_atomic(&mapping.output_filename, &decoded.bytes) {
        Ok(path) => {
            info!("{} -> {} ({} bytes)", mapping.tree_path, path.display(), size);
            EntryOutcome::Written {
                path,
                size,
                kind: decoded.kind,
                digest: content_hash(&decoded.bytes),
            }
        }
        Err(e) => {
            warn!("{}: {}", mapping.output_filename, e);
            EntryOutcome::WriteError(e)
        }
    }
}

/// BLAKE3 digest of `bytes` as lowercase hex
fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
