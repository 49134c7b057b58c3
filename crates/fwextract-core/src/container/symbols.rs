//! Resource-compiler symbol resolution.
//!
//! The resource compiler emits three constant arrays per resource bundle.
//! In C++ translation units they have internal linkage, so the symbol table
//! carries them mangled as `_ZL<len><name>`; Mach-O adds a leading
//! underscore to every symbol. All spellings are accepted.

use super::Section;
use object::{Object, ObjectSymbol, SectionIndex};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Symbol of the tree table
pub const TREE_SYMBOL: &str = "qt_resource_struct";
/// Symbol of the name table
pub const NAMES_SYMBOL: &str = "qt_resource_name";
/// Symbol of the data table
pub const DATA_SYMBOL: &str = "qt_resource_data";

/// A symbol resolved to an absolute file range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRange {
    /// Symbol name as found in the symbol table
    pub symbol: String,
    /// Absolute offset in the input file
    pub file_offset: u64,
    /// Size in bytes (declared, or inferred from the next symbol)
    pub size: u64,
    /// The symbol declared no size; `size` reaches the next symbol or the section end
    pub inferred: bool,
}

/// The three table symbols of one resource bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSymbols {
    /// Tree table
    pub tree: SymbolRange,
    /// Name table
    pub names: SymbolRange,
    /// Data table
    pub data: SymbolRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Tree,
    Names,
    Data,
}

const ROLES: [(&str, Role); 3] = [
    (TREE_SYMBOL, Role::Tree),
    (NAMES_SYMBOL, Role::Names),
    (DATA_SYMBOL, Role::Data),
];

fn classify(name: &str) -> Option<Role> {
    let unprefixed = name.strip_prefix('_').unwrap_or(name);
    ROLES.iter().find_map(|&(base, role)| {
        let mangled = format!("_ZL{}{}", base.len(), base);
        [name, unprefixed]
            .iter()
            .any(|candidate| *candidate == base || *candidate == mangled)
            .then_some(role)
    })
}

/// Resolves every resource symbol triple, paired in symbol-table order
pub(crate) fn resolve(
    file: &object::File<'_>,
    sections: &[Section],
    positions: &HashMap<SectionIndex, usize>,
) -> Vec<ResourceSymbols> {
    // Start addresses of all symbols per section, for size inference
    let mut starts: HashMap<SectionIndex, Vec<u64>> = HashMap::new();
    for symbol in file.symbols() {
        if let Some(index) = symbol.section_index() {
            starts.entry(index).or_default().push(symbol.address());
        }
    }
    for addresses in starts.values_mut() {
        addresses.sort_unstable();
        addresses.dedup();
    }

    let mut tree = Vec::new();
    let mut names = Vec::new();
    let mut data = Vec::new();

    for symbol in file.symbols() {
        let Ok(name) = symbol.name() else {
            continue;
        };
        let Some(role) = classify(name) else {
            continue;
        };
        let Some(index) = symbol.section_index() else {
            continue;
        };
        let Some(section) = positions.get(&index).map(|&pos| &sections[pos]) else {
            continue;
        };

        let address = symbol.address();
        let relative = match address.checked_sub(section.virtual_address) {
            Some(relative) if relative < section.size => relative,
            _ => {
                warn!(
                    "Symbol {} at {:#x} lies outside its section {}",
                    name, address, section.name
                );
                continue;
            }
        };

        let available = section.size - relative;
        let inferred = symbol.size() == 0;
        let size = if !inferred {
            symbol.size().min(available)
        } else {
            starts
                .get(&index)
                .and_then(|addresses| addresses.iter().find(|&&next| next > address))
                .map(|next| (next - address).min(available))
                .unwrap_or(available)
        };

        let range = SymbolRange {
            symbol: name.to_string(),
            file_offset: section.file_offset + relative,
            size,
            inferred,
        };
        debug!(
            "Resource symbol {} -> file offset {:#x}, {} bytes{}",
            range.symbol,
            range.file_offset,
            range.size,
            if inferred { " (inferred)" } else { "" }
        );

        match role {
            Role::Tree => tree.push(range),
            Role::Names => names.push(range),
            Role::Data => data.push(range),
        }
    }

    if tree.len() != names.len() || names.len() != data.len() {
        warn!(
            "Unbalanced resource symbols: {} tree, {} name, {} data; pairing the first {}",
            tree.len(),
            names.len(),
            data.len(),
            tree.len().min(names.len()).min(data.len())
        );
    }

    tree.into_iter()
        .zip(names)
        .zip(data)
        .map(|((tree, names), data)| ResourceSymbols { tree, names, data })
        .collect()
}
