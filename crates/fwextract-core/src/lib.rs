//! # fwextract-core
//!
//! A library for extracting device firmware from the compiled resource
//! archive embedded in the KingstVIS application binary.
//!
//! This crate provides the core functionality for:
//! - Loading ELF and Mach-O (thin or fat) executables
//! - Locating the resource tree, name and data tables, by symbol or by
//!   structural scanning of stripped binaries
//! - Decoding the resource tree without trusting its structure
//! - Inflating payloads and transcoding Intel HEX firmware to flat images
//! - Writing the images atomically under the names a driver expects
//!
//! ## Architecture
//!
//! - [`container`]: executable loading and resource symbol resolution
//! - [`locator`]: table location strategies
//! - [`tree`]: tree, name and data table decoding
//! - [`payload`]: decompression and hex transcoding
//! - [`mapping`]: tree path to output file name tables
//! - [`output`]: atomic output writes
//! - [`extract`]: the end-to-end pipeline
//! - [`error`]: error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use fwextract_core::{extract, ExtractOptions, MappingTable, NamingScheme};
//!
//! let table = MappingTable::for_scheme(NamingScheme::Sigrok);
//! let report = extract(
//!     "/Applications/KingstVIS.app/Contents/MacOS/KingstVIS",
//!     "./firmware",
//!     &table,
//!     &ExtractOptions::default(),
//! )?;
//!
//! for result in &report.results {
//!     println!("{}: {:?}", result.mapping.output_filename, result.outcome);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! - [`LocateStrategy`]: plug in another way of finding the tables
//! - [`MappingTable::new`]: extract a custom set of resources
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod container;
pub mod error;
pub mod extract;
pub mod locator;
pub mod mapping;
pub mod output;
pub mod payload;
pub mod tree;

// Re-export primary types for convenience
pub use container::{BinaryImage, ContainerFormat};
pub use error::{Error, Result};
pub use extract::{
    extract, open_bundles, EntryOutcome, ExtractOptions, ExtractionReport, ExtractionResult,
    ResourceBundle,
};
pub use locator::{LocateStrategy, LocatorConfig, ResourceTables, StructuralScanner, SymbolLocator};
pub use mapping::{FirmwareMapping, MappingTable, NamingScheme, PayloadKind};
pub use output::OutputDir;
pub use tree::{ResourceFile, ResourceNode, ResourceTree, TreeLayout, TreeLimits};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
