//! Error types for the fwextract-core library.
//!
//! Variants follow the pipeline stages: the container loader reports
//! [`Error::Format`], the locator [`Error::ResourceTableNotFound`], the tree
//! decoder [`Error::MalformedResourceTree`], and the payload transcoder
//! [`Error::PayloadCorrupt`], [`Error::HexChecksum`] and [`Error::HexFormat`].
//! The last group, together with [`Error::NotFoundInTree`], is reported per
//! mapping entry and never stops a run.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for fwextract operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all fwextract operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to create output directory
    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreate {
        /// Path to the directory that failed to create
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Output name would land outside the output directory
    #[error("path traversal detected: '{path}' would escape output directory")]
    PathTraversal {
        /// The suspicious path
        path: PathBuf,
    },

    /// The input is not a supported executable container, or its headers are truncated
    #[error("unsupported or malformed container '{path}': {details}")]
    Format {
        /// Path of the input binary
        path: PathBuf,
        /// What was wrong with it
        details: String,
    },

    /// None of the locator strategies could delimit the tree, name and data tables
    #[error("resource tables not found in '{path}' ({stage}): {details}")]
    ResourceTableNotFound {
        /// Path of the input binary
        path: PathBuf,
        /// Locator stage that exhausted its search space
        stage: &'static str,
        /// Detailed description
        details: String,
    },

    /// The resource tree is cyclic, out of range or otherwise inconsistent
    #[error(
        "malformed resource tree{}: {table} table offset {offset:#x}: {details}",
        binary_suffix(.path)
    )]
    MalformedResourceTree {
        /// Path of the input binary, once known
        path: Option<PathBuf>,
        /// Table the offset points into: `tree`, `names` or `data`
        table: &'static str,
        /// Byte offset inside that table
        offset: usize,
        /// Detailed description
        details: String,
    },

    /// A payload could not be read or inflated to its declared size
    #[error("corrupt payload for '{entry}' at data offset {offset:#x}: {details}")]
    PayloadCorrupt {
        /// Tree path of the resource
        entry: String,
        /// Offset of the payload inside the data table
        offset: usize,
        /// Detailed description
        details: String,
    },

    /// A hex-text record failed its checksum
    #[error(
        "hex checksum mismatch in '{entry}' line {line}: stored {stored:#04x}, computed {computed:#04x}"
    )]
    HexChecksum {
        /// Tree path of the resource
        entry: String,
        /// 1-based line number of the record
        line: usize,
        /// Checksum byte found in the record
        stored: u8,
        /// Checksum computed over the record
        computed: u8,
    },

    /// Stored hex text that must be kept verbatim is structurally invalid
    #[error("malformed hex record in '{entry}' line {line}: {details}")]
    HexFormat {
        /// Tree path of the resource
        entry: String,
        /// 1-based line number of the record
        line: usize,
        /// Detailed description
        details: String,
    },

    /// A mapping entry's tree path does not exist in the decoded tree
    #[error("'{path}' not found in resource tree")]
    NotFoundInTree {
        /// The tree path that was looked up
        path: String,
    },
}

fn binary_suffix(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in '{}'", path.display()),
        None => String::new(),
    }
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new directory creation error
    pub fn directory_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreate {
            path: path.into(),
            source,
        }
    }

    /// Creates a new path traversal error
    pub fn path_traversal(path: impl Into<PathBuf>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// Creates a new container format error
    pub fn format(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Creates a new table-not-found error
    pub fn table_not_found(
        path: impl Into<PathBuf>,
        stage: &'static str,
        details: impl Into<String>,
    ) -> Self {
        Self::ResourceTableNotFound {
            path: path.into(),
            stage,
            details: details.into(),
        }
    }

    /// Creates a new malformed tree error
    pub fn malformed_tree(table: &'static str, offset: usize, details: impl Into<String>) -> Self {
        Self::MalformedResourceTree {
            path: None,
            table,
            offset,
            details: details.into(),
        }
    }

    /// Attaches the input binary to errors raised while decoding its tables
    pub fn in_binary(self, binary: &Path) -> Self {
        match self {
            Self::MalformedResourceTree {
                path: None,
                table,
                offset,
                details,
            } => Self::MalformedResourceTree {
                path: Some(binary.to_path_buf()),
                table,
                offset,
                details,
            },
            other => other,
        }
    }

    /// Creates a new corrupt payload error
    pub fn payload_corrupt(entry: impl Into<String>, offset: usize, details: impl Into<String>) -> Self {
        Self::PayloadCorrupt {
            entry: entry.into(),
            offset,
            details: details.into(),
        }
    }

    /// Creates a new not-found error
    pub fn not_found_in_tree(path: impl Into<String>) -> Self {
        Self::NotFoundInTree { path: path.into() }
    }
}
