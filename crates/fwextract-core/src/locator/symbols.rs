//! Symbol-delimited tables.

use super::{LocateStrategy, ResourceTables, TableOrigin};
use crate::container::BinaryImage;
use crate::error::{Error, Result};
use crate::tree::TreeLayout;
use tracing::debug;

/// Slices the tables at the resource-compiler symbols resolved by the loader
#[derive(Debug, Clone, Default)]
pub struct SymbolLocator;

impl SymbolLocator {
    /// Creates a new symbol locator
    pub fn new() -> Self {
        Self
    }
}

impl LocateStrategy for SymbolLocator {
    fn name(&self) -> &'static str {
        "symbol"
    }

    fn locate<'a>(&self, image: &'a BinaryImage) -> Result<Vec<ResourceTables<'a>>> {
        let mut bundles = Vec::new();

        for symbols in image.resource_symbols() {
            let tree = image.bytes(symbols.tree.file_offset, symbols.tree.size)?;
            let names = image.bytes(symbols.names.file_offset, symbols.names.size)?;
            let data = image.bytes(symbols.data.file_offset, symbols.data.size)?;

            // The root record is the only thing every bundle must have
            if tree.len() < TreeLayout::V1.record_width {
                return Err(Error::table_not_found(
                    image.path(),
                    "symbols",
                    format!(
                        "{} is {} bytes, smaller than one tree record",
                        symbols.tree.symbol,
                        tree.len()
                    ),
                ));
            }

            debug!(
                "Bundle via symbols: tree {:#x} ({} B), names {:#x} ({} B), data {:#x} ({} B)",
                symbols.tree.file_offset,
                tree.len(),
                symbols.names.file_offset,
                names.len(),
                symbols.data.file_offset,
                data.len()
            );

            bundles.push(ResourceTables {
                tree,
                names,
                data,
                layout: None,
                sizes_inferred: symbols.tree.inferred || symbols.names.inferred || symbols.data.inferred,
                origin: TableOrigin {
                    tree: symbols.tree.file_offset,
                    names: symbols.names.file_offset,
                    data: symbols.data.file_offset,
                },
            });
        }

        if bundles.is_empty() {
            return Err(Error::table_not_found(
                image.path(),
                "symbols",
                "no resource symbols in the symbol table",
            ));
        }
        Ok(bundles)
    }
}
