//! The reloadable whitelist of metric index identifiers.
//!
//! A [`FavoredIndexSet`] is immutable once loaded. [`FavoredState`] holds the
//! current set behind an [`Arc`] and reloading swaps the whole `Arc`, so a
//! cycle that captured a snapshot keeps seeing exactly the set it started with.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Failure to read the whitelist filter file.
#[derive(Debug, Error)]
#[error("failed to read filter file '{}': {source}", path.display())]
pub struct FilterFileError {
    /// Filter file that could not be read.
    pub path: PathBuf,
    /// Underlying IO error.
    #[source]
    pub source: io::Error,
}

/// Whitelist of metric index identifiers eligible for persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FavoredIndexSet {
    indexes: HashSet<String>,
}

impl FavoredIndexSet {
    /// Parses filter file contents.
    ///
    /// Lines are trimmed; blank lines and lines starting with `#` are ignored.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let indexes = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect();
        Self { indexes }
    }

    /// Reads and parses a filter file.
    pub fn load(path: &Path) -> Result<Self, FilterFileError> {
        let contents = fs::read_to_string(path).map_err(|source| FilterFileError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&contents))
    }

    /// Returns `true` when `index` is whitelisted.
    #[must_use]
    pub fn contains(&self, index: &str) -> bool {
        self.indexes.contains(index)
    }

    /// Number of whitelisted identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Returns `true` when nothing is whitelisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for FavoredIndexSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            indexes: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Current whitelist plus the file it is reloaded from.
#[derive(Debug)]
pub struct FavoredState {
    path: PathBuf,
    current: Arc<FavoredIndexSet>,
}

impl FavoredState {
    /// Loads the initial whitelist; failure here is fatal at launch.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, FilterFileError> {
        let path = path.into();
        let current = Arc::new(FavoredIndexSet::load(&path)?);
        Ok(Self { path, current })
    }

    /// Snapshot for one cycle; later reloads never alter it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<FavoredIndexSet> {
        Arc::clone(&self.current)
    }

    /// Re-reads the filter file and swaps in the new set.
    ///
    /// On error the previous set stays in force.
    pub fn reload(&mut self) -> Result<usize, FilterFileError> {
        let next = FavoredIndexSet::load(&self.path)?;
        let count = next.len();
        self.current = Arc::new(next);
        Ok(count)
    }
}
