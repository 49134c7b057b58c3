//! Resource table location.
//!
//! Delimits the three resource tables (tree, names, data) inside a loaded
//! [`BinaryImage`]. Two interchangeable strategies implement
//! [`LocateStrategy`]:
//!
//! - [`SymbolLocator`]: the resource-compiler symbols delimit the tables;
//!   only minimum sizes are validated.
//! - [`StructuralScanner`]: no symbols; the tables are recovered from the
//!   format's constant-data section by self-consistency checks.
//!
//! [`locate`] picks the strategy for an image. Every scan threshold is a
//! named field of [`LocatorConfig`].

mod scan;
mod symbols;

use crate::container::BinaryImage;
use crate::error::Result;
use crate::tree::{TreeLayout, TreeLimits};
use tracing::debug;

pub use scan::StructuralScanner;
pub use symbols::SymbolLocator;

/// Absolute file offsets the tables were sliced from, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableOrigin {
    /// Offset of the tree table
    pub tree: u64,
    /// Offset of the name table
    pub names: u64,
    /// Offset of the data table
    pub data: u64,
}

/// The three resource tables of one bundle, borrowed from the image.
///
/// Offsets stored inside each table are relative to that table's start.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTables<'a> {
    /// Tree table
    pub tree: &'a [u8],
    /// Name table
    pub names: &'a [u8],
    /// Data table
    pub data: &'a [u8],
    /// Record layout, when the locator already established it
    pub layout: Option<TreeLayout>,
    /// Table lengths are upper bounds inferred from neighbouring symbols, so
    /// alignment padding may trail the tree table
    pub sizes_inferred: bool,
    /// Where the tables were found
    pub origin: TableOrigin,
}

/// Tunables for the locator strategies
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// Directory name known to appear in the name table
    pub anchor_name: String,
    /// Longest plausible name, in UTF-16 units
    pub max_name_len: usize,
    /// Maximum bytes walked through the name table in either direction
    pub name_walk_limit: usize,
    /// Smallest blob accepted while looking for the data table
    pub min_blob_size: u32,
    /// Largest blob accepted while looking for the data table
    pub max_blob_size: u32,
    /// Consecutive in-bounds blobs a data table must contain somewhere in its entry chain
    pub min_blob_run: usize,
    /// Bounds for walking candidate trees
    pub tree_limits: TreeLimits,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            anchor_name: "fwusb".to_string(),
            max_name_len: 64,
            name_walk_limit: 64 * 1024,
            min_blob_size: 100,
            max_blob_size: 1_000_000,
            min_blob_run: 5,
            tree_limits: TreeLimits::default(),
        }
    }
}

impl LocatorConfig {
    /// Creates a new locator config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the anchor directory name
    pub fn anchor_name(mut self, name: impl Into<String>) -> Self {
        self.anchor_name = name.into();
        self
    }

    /// Sets the longest plausible name
    pub fn max_name_len(mut self, len: usize) -> Self {
        self.max_name_len = len;
        self
    }

    /// Sets the name table walk limit
    pub fn name_walk_limit(mut self, bytes: usize) -> Self {
        self.name_walk_limit = bytes;
        self
    }

    /// Sets the minimum blob size of the data table run
    pub fn min_blob_size(mut self, size: u32) -> Self {
        self.min_blob_size = size;
        self
    }

    /// Sets the maximum blob size of the data table run
    pub fn max_blob_size(mut self, size: u32) -> Self {
        self.max_blob_size = size;
        self
    }

    /// Sets the required run of consecutive blobs
    pub fn min_blob_run(mut self, run: usize) -> Self {
        self.min_blob_run = run;
        self
    }

    /// Sets the tree walk bounds
    pub fn tree_limits(mut self, limits: TreeLimits) -> Self {
        self.tree_limits = limits;
        self
    }
}

/// A way of finding the resource tables in an image
pub trait LocateStrategy: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Finds every resource bundle in the image
    fn locate<'a>(&self, image: &'a BinaryImage) -> Result<Vec<ResourceTables<'a>>>;
}

/// Chooses the strategy for an image: symbols when present, scanning otherwise
pub fn strategy_for(image: &BinaryImage, config: &LocatorConfig) -> Box<dyn LocateStrategy> {
    if image.resource_symbols().is_empty() {
        Box::new(StructuralScanner::with_config(config.clone()))
    } else {
        Box::new(SymbolLocator::new())
    }
}

/// Locates every resource bundle in the image
pub fn locate<'a>(image: &'a BinaryImage, config: &LocatorConfig) -> Result<Vec<ResourceTables<'a>>> {
    let strategy = strategy_for(image, config);
    debug!(
        "Locating resource tables in {} ({}) with the {} strategy",
        image.path().display(),
        image.format(),
        strategy.name()
    );
    strategy.locate(image)
}
