//! Atomic output writing.
//!
//! Every file is written to a temporary file inside the destination
//! directory, synced, then renamed over its final name, so a reader never
//! observes a partially written file. Existing files are replaced.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// A destination directory held for the duration of a run
#[derive(Debug)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    /// Creates `path` (and its parents) if needed
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        std::fs::create_dir_all(&root).map_err(|e| Error::directory_create(&root, e))?;
        debug!("Output directory {}", root.display());
        Ok(Self { root })
    }

    /// The directory path
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Atomically writes `bytes` to `file_name` inside the directory.
    ///
    /// `file_name` must be a single plain path component.
    pub fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let target = self.resolve(file_name)?;

        let mut temp = NamedTempFile::new_in(&self.root).map_err(|e| Error::file_write(&target, e))?;
        trace!("Staging {} via {}", target.display(), temp.path().display());

        temp.write_all(bytes)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| Error::file_write(&target, e))?;
        temp.persist(&target)
            .map_err(|e| Error::file_write(&target, e.error))?;

        debug!("Wrote {} ({} bytes)", target.display(), bytes.len());
        Ok(target)
    }

    /// Final path of `file_name`, rejecting anything but a plain file name
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(Error::path_traversal(file_name)),
        }
    }
}
