//! Resource tree decoding.
//!
//! Walks the tree, name and data tables into a [`ResourceTree`] of
//! directory and file nodes. Record 0 is the root directory; a directory's
//! children are `child_count` consecutive records starting at
//! `first_child`.
//!
//! The tables come from an untrusted binary, so the walk never assumes the
//! graph is a tree: every record index may be visited once, recursion is
//! capped at [`TreeLimits::max_depth`], and any violation yields
//! [`Error::MalformedResourceTree`].
//!
//! When the layout version is unknown, each of [`TreeLayout::CANDIDATES`]
//! is tried and the first one whose walk reaches every record of the table
//! exactly once is accepted. When the table length was inferred rather than
//! declared, trailing bytes are tolerated and the layout covering the most
//! of the table is accepted.

mod layout;

use crate::error::{Error, Result};
use crate::locator::ResourceTables;
use std::collections::HashSet;
use tracing::{debug, trace};

pub use layout::{
    data_entry_len, decode_name, encode_name, name_hash, Compression, NameEntry, RawRecord,
    TreeLayout, DATA_HEADER_LEN, FLAG_COMPRESSED, FLAG_COMPRESSED_ZSTD, FLAG_DIRECTORY,
    NAME_HEADER_LEN,
};

/// Bounds applied while walking an untrusted tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLimits {
    /// Maximum directory nesting
    pub max_depth: usize,
    /// Maximum number of records considered
    pub max_records: usize,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_records: 65_536,
        }
    }
}

/// A directory node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDirectory {
    /// Directory name; empty for the root
    pub name: String,
    /// Children in record order
    pub children: Vec<ResourceNode>,
}

/// A file node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFile {
    /// File name
    pub name: String,
    /// Offset of the data entry in the data table
    pub data_offset: u32,
    /// Length of the stored payload (compressed length for compressed files)
    pub data_size: u32,
    /// Payload compression
    pub compression: Compression,
    /// Uncompressed size declared by a zlib payload's size prefix
    pub declared_size: Option<u32>,
    /// Locale territory code
    pub territory: u16,
    /// Locale language code
    pub language: u16,
    /// Modification time, layout version 2 and later
    pub last_modified: Option<u64>,
}

impl ResourceFile {
    /// Byte range of the stored payload within the data table
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        let start = self.data_offset as usize + DATA_HEADER_LEN;
        start..start + self.data_size as usize
    }
}

/// A node of the decoded resource tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceNode {
    /// Directory
    Directory(ResourceDirectory),
    /// File
    File(ResourceFile),
}

impl ResourceNode {
    /// Node name
    pub fn name(&self) -> &str {
        match self {
            ResourceNode::Directory(dir) => &dir.name,
            ResourceNode::File(file) => &file.name,
        }
    }

    /// Child with the given name, matched case-sensitively
    pub fn child(&self, name: &str) -> Option<&ResourceNode> {
        match self {
            ResourceNode::Directory(dir) => dir.children.iter().find(|c| c.name() == name),
            ResourceNode::File(_) => None,
        }
    }
}

/// A fully decoded resource tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTree {
    root: ResourceNode,
    layout: TreeLayout,
    record_count: usize,
}

impl ResourceTree {
    /// The root directory
    pub fn root(&self) -> &ResourceNode {
        &self.root
    }

    /// Layout the tree was decoded with
    pub fn layout(&self) -> TreeLayout {
        self.layout
    }

    /// Number of records reached by the walk
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Bytes of the tree table taken up by the reachable records
    pub fn covered_len(&self) -> usize {
        self.layout.record_offset(self.record_count)
    }

    /// Looks up a node by `/`-separated path; a leading `/` is ignored
    pub fn find(&self, path: &str) -> Option<&ResourceNode> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(&self.root, |node, part| node.child(part))
    }

    /// Looks up a file node by path
    pub fn find_file(&self, path: &str) -> Option<&ResourceFile> {
        match self.find(path)? {
            ResourceNode::File(file) => Some(file),
            ResourceNode::Directory(_) => None,
        }
    }

    /// Every file with its full path, depth-first in record order
    pub fn files(&self) -> Vec<(String, &ResourceFile)> {
        let mut out = Vec::new();
        collect_files(&self.root, "", &mut out);
        out
    }

    /// Returns true if any node carries `name`
    pub fn contains_name(&self, name: &str) -> bool {
        fn visit(node: &ResourceNode, name: &str) -> bool {
            match node {
                ResourceNode::File(file) => file.name == name,
                ResourceNode::Directory(dir) => {
                    dir.name == name || dir.children.iter().any(|c| visit(c, name))
                }
            }
        }
        visit(&self.root, name)
    }
}

fn collect_files<'t>(node: &'t ResourceNode, prefix: &str, out: &mut Vec<(String, &'t ResourceFile)>) {
    match node {
        ResourceNode::File(file) => out.push((join(prefix, &file.name), file)),
        ResourceNode::Directory(dir) => {
            let prefix = join(prefix, &dir.name);
            for child in &dir.children {
                collect_files(child, &prefix, out);
            }
        }
    }
}

fn join(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (_, true) => prefix.to_string(),
        (true, false) => name.to_string(),
        (false, false) => format!("{prefix}/{name}"),
    }
}

/// Decodes the tables into a tree, probing layouts unless the locator fixed one
pub fn decode(tables: &ResourceTables<'_>, limits: TreeLimits) -> Result<ResourceTree> {
    let candidates: Vec<TreeLayout> = match tables.layout {
        Some(layout) => vec![layout],
        None => TreeLayout::CANDIDATES.to_vec(),
    };

    let mut last_error = None;
    let mut widest: Option<ResourceTree> = None;
    for layout in candidates {
        if !tables.sizes_inferred && tables.tree.len() % layout.record_width != 0 {
            trace!(
                "Layout v{} rejected: tree size {} is not a multiple of {}",
                layout.version,
                tables.tree.len(),
                layout.record_width
            );
            continue;
        }

        let record_count = layout.record_capacity(tables.tree.len()).min(limits.max_records);
        let walker = Walker::new(tables.tree, tables.names, Some(tables.data), layout, limits, record_count);
        match walker.run() {
            Ok(tree) if tree.record_count == record_count && !tables.sizes_inferred => {
                debug!(
                    "Decoded resource tree with layout v{}: {} records, {} files",
                    layout.version,
                    tree.record_count,
                    tree.files().len()
                );
                return Ok(tree);
            }
            // An inferred tree length may include padding; the widest walk wins
            Ok(tree) if tables.sizes_inferred => {
                trace!(
                    "Layout v{} covers {} of {} tree bytes",
                    layout.version,
                    tree.covered_len(),
                    tables.tree.len()
                );
                if widest.as_ref().map_or(true, |w| w.covered_len() < tree.covered_len()) {
                    widest = Some(tree);
                }
            }
            Ok(tree) => {
                trace!(
                    "Layout v{} reached {} of {} records",
                    layout.version,
                    tree.record_count,
                    record_count
                );
                last_error = Some(Error::malformed_tree(
                    "tree",
                    layout.record_offset(tree.record_count),
                    format!(
                        "layout v{} leaves {} unreachable records",
                        layout.version,
                        record_count - tree.record_count
                    ),
                ));
            }
            Err(e) => {
                trace!("Layout v{} rejected: {}", layout.version, e);
                last_error = Some(e);
            }
        }
    }

    if let Some(tree) = widest {
        debug!(
            "Decoded resource tree with layout v{}: {} records, {} files, {} trailing tree bytes ignored",
            tree.layout.version,
            tree.record_count,
            tree.files().len(),
            tables.tree.len() - tree.covered_len()
        );
        return Ok(tree);
    }

    Err(last_error.unwrap_or_else(|| {
        Error::malformed_tree(
            "tree",
            0,
            format!("tree table of {} bytes matches no known record layout", tables.tree.len()),
        )
    }))
}

/// Walks the tree structure without a data table.
///
/// Used by the structural scanner, which must validate a candidate tree
/// before the data table is known. `tree` may extend past the end of the
/// table; the returned tree's record count tells how much was consumed.
/// File nodes have `data_size` 0 and no declared size.
pub fn decode_structure(
    tree: &[u8],
    names: &[u8],
    layout: TreeLayout,
    limits: TreeLimits,
) -> Result<ResourceTree> {
    let record_count = layout.record_capacity(tree.len()).min(limits.max_records);
    Walker::new(tree, names, None, layout, limits, record_count).run()
}

struct Walker<'a> {
    tree: &'a [u8],
    names: &'a [u8],
    data: Option<&'a [u8]>,
    layout: TreeLayout,
    limits: TreeLimits,
    record_count: usize,
    visited: HashSet<usize>,
    highest: usize,
}

impl<'a> Walker<'a> {
    fn new(
        tree: &'a [u8],
        names: &'a [u8],
        data: Option<&'a [u8]>,
        layout: TreeLayout,
        limits: TreeLimits,
        record_count: usize,
    ) -> Self {
        Self {
            tree,
            names,
            data,
            layout,
            limits,
            record_count,
            visited: HashSet::new(),
            highest: 0,
        }
    }

    fn run(mut self) -> Result<ResourceTree> {
        if self.record_count == 0 {
            return Err(Error::malformed_tree("tree", 0, "tree table holds no records"));
        }

        let root = self.node(0, 0)?;
        if !matches!(root, ResourceNode::Directory(_)) {
            return Err(Error::malformed_tree("tree", 0, "root record is not a directory"));
        }

        if self.highest + 1 != self.visited.len() {
            return Err(Error::malformed_tree(
                "tree",
                self.layout.record_offset(self.highest),
                format!(
                    "records are not contiguous: {} visited, highest index {}",
                    self.visited.len(),
                    self.highest
                ),
            ));
        }

        Ok(ResourceTree {
            root,
            layout: self.layout,
            record_count: self.visited.len(),
        })
    }

    fn node(&mut self, index: usize, depth: usize) -> Result<ResourceNode> {
        let offset = self.layout.record_offset(index);

        if depth > self.limits.max_depth {
            return Err(Error::malformed_tree(
                "tree",
                offset,
                format!("depth bound of {} exceeded", self.limits.max_depth),
            ));
        }
        if index >= self.record_count {
            return Err(Error::malformed_tree(
                "tree",
                offset,
                format!("record index {index} out of range ({} records)", self.record_count),
            ));
        }
        if !self.visited.insert(index) {
            return Err(Error::malformed_tree(
                "tree",
                offset,
                format!("record {index} reached twice (cycle or shared child)"),
            ));
        }
        self.highest = self.highest.max(index);

        match self.layout.decode_record(self.tree, index)? {
            RawRecord::Directory {
                name_offset,
                child_count,
                first_child,
            } => {
                let name = if index == 0 {
                    String::new()
                } else {
                    self.name(name_offset)?
                };

                let first = first_child as usize;
                let end = first
                    .checked_add(child_count as usize)
                    .filter(|end| *end <= self.record_count)
                    .ok_or_else(|| {
                        Error::malformed_tree(
                            "tree",
                            offset,
                            format!(
                                "directory '{name}' children {first}+{child_count} out of range ({} records)",
                                self.record_count
                            ),
                        )
                    })?;

                let mut children = Vec::with_capacity(end - first);
                for child in first..end {
                    children.push(self.node(child, depth + 1)?);
                }
                Ok(ResourceNode::Directory(ResourceDirectory { name, children }))
            }
            RawRecord::File {
                name_offset,
                compression,
                territory,
                language,
                data_offset,
                last_modified,
            } => {
                if index == 0 {
                    return Err(Error::malformed_tree("tree", offset, "root record is not a directory"));
                }
                let name = self.name(name_offset)?;
                let (data_size, declared_size) = match self.data {
                    Some(data) => resolve_payload(data, data_offset, compression, &name)?,
                    None => (0, None),
                };
                Ok(ResourceNode::File(ResourceFile {
                    name,
                    data_offset,
                    data_size,
                    compression,
                    declared_size,
                    territory,
                    language,
                    last_modified,
                }))
            }
        }
    }

    fn name(&self, name_offset: u32) -> Result<String> {
        Ok(decode_name(self.names, name_offset as usize)?.name)
    }
}

fn resolve_payload(
    data: &[u8],
    data_offset: u32,
    compression: Compression,
    name: &str,
) -> Result<(u32, Option<u32>)> {
    let offset = data_offset as usize;
    let size = data_entry_len(data, offset).ok_or_else(|| {
        Error::malformed_tree(
            "data",
            offset,
            format!("data entry of '{name}' starts outside the data table ({} bytes)", data.len()),
        )
    })?;

    let start = offset + DATA_HEADER_LEN;
    let payload = data.get(start..start + size as usize).ok_or_else(|| {
        Error::malformed_tree(
            "data",
            offset,
            format!("payload of '{name}' ({size} bytes) overruns the data table"),
        )
    })?;

    let declared = match compression {
        Compression::Zlib if payload.len() >= 4 => Some(layout::be_u32(payload, 0)),
        _ => None,
    };
    Ok((size, declared))
}
