//! Structural recovery of the resource tables from a stripped image.
//!
//! ## Algorithm Overview
//!
//! 1. Search the constant-data section for the encoded name entry of a
//!    known directory (the anchor, `fwusb` by default).
//! 2. Walk backward through hash-consistent name entries to the start of
//!    the name table, then forward to its end.
//! 3. Probe every offset after the name table (then before it) for a root
//!    directory record, and accept the first candidate whose structure-only
//!    walk resolves every name and contains the anchor.
//! 4. Probe every offset after the name table (then before it) for a data
//!    table: an entry chain that lands on every file record's data offset
//!    and contains a run of plausibly sized blobs. Small entries such as
//!    icons may precede the run.
//!
//! Each stage fails with [`Error::ResourceTableNotFound`] naming the stage
//! once its search space is exhausted.

use super::{LocateStrategy, LocatorConfig, ResourceTables, TableOrigin};
use crate::container::BinaryImage;
use crate::error::{Error, Result};
use crate::tree::{
    data_entry_len, decode_name, decode_structure, encode_name, RawRecord, ResourceTree,
    TreeLayout, DATA_HEADER_LEN, NAME_HEADER_LEN,
};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, trace};

/// Self-consistency scanner over a constant-data section
#[derive(Debug, Clone, Default)]
pub struct StructuralScanner {
    config: LocatorConfig,
}

impl StructuralScanner {
    /// Creates a new scanner with default thresholds
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new scanner with custom thresholds
    pub fn with_config(config: LocatorConfig) -> Self {
        Self { config }
    }

    /// Recovers the tables from `blob`.
    ///
    /// `base` is the absolute file offset of `blob`, used for
    /// [`TableOrigin`]; `path` only appears in errors.
    pub fn scan<'a>(&self, path: &Path, blob: &'a [u8], base: u64) -> Result<ResourceTables<'a>> {
        let anchor = self.find_anchor(blob).ok_or_else(|| {
            Error::table_not_found(
                path,
                "anchor",
                format!("no name entry for '{}'", self.config.anchor_name),
            )
        })?;
        trace!("Anchor '{}' at blob offset {:#x}", self.config.anchor_name, anchor);

        let names_range = self.names_start(blob, anchor)..self.names_end(blob, anchor);
        let names = &blob[names_range.clone()];
        debug!(
            "Name table candidate {:#x}..{:#x} ({} bytes)",
            names_range.start,
            names_range.end,
            names.len()
        );

        let (tree_offset, tree) = self.find_tree(blob, names, &names_range).ok_or_else(|| {
            Error::table_not_found(
                path,
                "tree",
                format!(
                    "no root record near the name table at {:#x}",
                    names_range.start
                ),
            )
        })?;
        let layout = tree.layout();
        let tree_range = tree_offset..tree_offset + layout.record_offset(tree.record_count());
        debug!(
            "Tree table at {:#x}: layout v{}, {} records",
            tree_offset,
            layout.version,
            tree.record_count()
        );

        let data_start = self
            .find_data(blob, &tree, &names_range, &tree_range)
            .ok_or_else(|| {
                Error::table_not_found(
                    path,
                    "data",
                    "no blob chain lands on every file's data offset",
                )
            })?;
        debug!("Data table at {:#x}", data_start);

        Ok(ResourceTables {
            tree: &blob[tree_range.clone()],
            names,
            data: &blob[data_start..],
            layout: Some(layout),
            sizes_inferred: false,
            origin: TableOrigin {
                tree: base + tree_range.start as u64,
                names: base + names_range.start as u64,
                data: base + data_start as u64,
            },
        })
    }

    /// Offset of the anchor's name entry, header and hash verified
    fn find_anchor(&self, blob: &[u8]) -> Option<usize> {
        let entry = encode_name(&self.config.anchor_name);
        let (header, chars) = entry.split_at(NAME_HEADER_LEN);
        if chars.is_empty() {
            return None;
        }

        let mut position = 0;
        while let Some(relative) = find_subsequence(&blob[position..], chars) {
            let at = position + relative;
            if at >= NAME_HEADER_LEN && &blob[at - NAME_HEADER_LEN..at] == header {
                return Some(at - NAME_HEADER_LEN);
            }
            position = at + 1;
        }
        None
    }

    /// A name entry that can belong to the table, returning its size
    fn name_entry_at(&self, blob: &[u8], offset: usize) -> Option<usize> {
        let entry = decode_name(blob, offset).ok()?;
        let units = (entry.encoded_len - NAME_HEADER_LEN) / 2;
        (1..=self.config.max_name_len)
            .contains(&units)
            .then_some(entry.encoded_len)
    }

    fn names_start(&self, blob: &[u8], anchor: usize) -> usize {
        let mut start = anchor;
        'walk: while anchor - start < self.config.name_walk_limit {
            for units in 1..=self.config.max_name_len {
                let Some(previous) = start.checked_sub(NAME_HEADER_LEN + units * 2) else {
                    break 'walk;
                };
                if self.name_entry_at(blob, previous) == Some(start - previous) {
                    start = previous;
                    continue 'walk;
                }
            }
            break;
        }
        start
    }

    fn names_end(&self, blob: &[u8], anchor: usize) -> usize {
        let mut end = anchor;
        while end - anchor < self.config.name_walk_limit {
            match self.name_entry_at(blob, end) {
                Some(len) => end += len,
                None => break,
            }
        }
        end
    }

    /// First offset holding a tree that decodes against `names` and contains the anchor
    fn find_tree(
        &self,
        blob: &[u8],
        names: &[u8],
        names_range: &Range<usize>,
    ) -> Option<(usize, ResourceTree)> {
        let after = (names_range.end..blob.len()).map(|offset| (offset, blob.len()));
        let before = (0..names_range.start)
            .rev()
            .map(|offset| (offset, names_range.start));

        for (offset, limit) in after.chain(before) {
            let candidate = &blob[offset..limit];
            if !self.plausible_root(candidate) {
                continue;
            }

            for layout in TreeLayout::CANDIDATES {
                match decode_structure(candidate, names, layout, self.config.tree_limits) {
                    Ok(tree) if tree.contains_name(&self.config.anchor_name) => {
                        return Some((offset, tree));
                    }
                    Ok(_) => trace!("Tree at {:#x} (v{}) lacks the anchor", offset, layout.version),
                    Err(e) => trace!("Tree at {:#x} (v{}) rejected: {}", offset, layout.version, e),
                }
            }
        }
        None
    }

    fn plausible_root(&self, candidate: &[u8]) -> bool {
        matches!(
            TreeLayout::V1.decode_record(candidate, 0),
            Ok(RawRecord::Directory {
                name_offset: 0,
                child_count,
                first_child: 1,
            }) if child_count >= 1 && child_count as usize <= self.config.tree_limits.max_records
        )
    }

    /// Start of the data table; it must not overlap the other two tables
    fn find_data(
        &self,
        blob: &[u8],
        tree: &ResourceTree,
        names_range: &Range<usize>,
        tree_range: &Range<usize>,
    ) -> Option<usize> {
        let mut offsets: Vec<u32> = tree.files().iter().map(|(_, f)| f.data_offset).collect();
        offsets.sort_unstable();
        offsets.dedup();

        let after = names_range.end..blob.len();
        let before = 0..names_range.start;

        after.chain(before).find(|&start| {
            self.data_table_end(blob, start, &offsets)
                .map(|end| start..end)
                .is_some_and(|span| !overlaps(&span, names_range) && !overlaps(&span, tree_range))
        })
    }

    /// End of the last referenced entry if a data table can start at `start`.
    ///
    /// The entry chain must land on every referenced offset, and somewhere
    /// along it hold `min_blob_run` consecutive blobs within the configured
    /// size bounds (fewer when the tree references fewer files). Entries
    /// outside the run only need to fit `max_blob_size`.
    fn data_table_end(&self, blob: &[u8], start: usize, offsets: &[u32]) -> Option<usize> {
        let required = self.config.min_blob_run.min(offsets.len()).max(1);
        let mut position = start;
        let mut end = start;
        let mut run = 0;
        let mut longest_run = 0;
        let mut pending = offsets.iter().map(|&o| o as usize).peekable();

        while let Some(&wanted) = pending.peek() {
            let relative = position - start;
            if relative > wanted {
                return None;
            }
            let len = data_entry_len(blob, position)?;
            if len > self.config.max_blob_size {
                return None;
            }
            run = if len >= self.config.min_blob_size { run + 1 } else { 0 };
            longest_run = longest_run.max(run);

            let next = entry_end(blob, position, len)?;
            if relative == wanted {
                pending.next();
                end = next;
            }
            position = next;
        }

        if longest_run < required {
            trace!(
                "Data candidate at {:#x}: longest blob run {} of {} required",
                start,
                longest_run,
                required
            );
            return None;
        }
        Some(end)
    }
}

impl LocateStrategy for StructuralScanner {
    fn name(&self) -> &'static str {
        "structural scan"
    }

    fn locate<'a>(&self, image: &'a BinaryImage) -> Result<Vec<ResourceTables<'a>>> {
        let (segment, name) = image.format().const_section();
        let section = image.const_section().ok_or_else(|| {
            let qualified = match segment {
                Some(segment) => format!("{segment},{name}"),
                None => name.to_string(),
            };
            Error::table_not_found(image.path(), "section", format!("no {qualified} section"))
        })?;

        let blob = image.section_data(section)?;
        debug!(
            "Scanning {} bytes of {} at file offset {:#x}",
            blob.len(),
            section.name,
            section.file_offset
        );
        Ok(vec![self.scan(image.path(), blob, section.file_offset)?])
    }
}

fn entry_end(blob: &[u8], position: usize, len: u32) -> Option<usize> {
    position
        .checked_add(DATA_HEADER_LEN + len as usize)
        .filter(|end| *end <= blob.len())
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Find a subsequence within a byte slice
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
