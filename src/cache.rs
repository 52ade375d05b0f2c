// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Durable cache over one fleet source's attribute tree.
//!
//! [`FlakeCache`] wraps a single [`CacheEntry`] root with selector-text entry
//! points, durable JSON persistence, and leaf-only access tracking. The cache
//! file is shared mutable state between independent invocations against the
//! same pinned source, so persistence is write-to-temp-then-rename: a reader
//! never observes a partial file, and the last completed writer wins.
//!
//! No lock file is involved. Writers are expected to reload the file and
//! merge before writing (see the orchestrator), which keeps concurrently
//! cached selections from other processes alive. Identical re-insertions are
//! no-ops, so overlapping writers against one pinned source content are safe.

pub mod entry;

use crate::{selector::Selector, store::ArtifactStore};
pub use entry::{CacheEntry, CacheError, CacheValue};

use serde_json::{json, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// In-memory cache for one fleet source, with durable (de)serialization.
#[derive(Clone, Debug, Default)]
pub struct FlakeCache {
    root: CacheEntry,
    store: ArtifactStore,
}

impl PartialEq for FlakeCache {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl FlakeCache {
    /// Construct an empty cache checked against the environment's store.
    pub fn new() -> Self {
        Self::with_store(ArtifactStore::from_env())
    }

    /// Construct an empty cache checked against the given store.
    pub fn with_store(store: ArtifactStore) -> Self {
        Self {
            root: CacheEntry::default(),
            store,
        }
    }

    /// Root entry of the cached tree.
    pub fn root(&self) -> &CacheEntry {
        &self.root
    }

    /// Insert an evaluated value at the position addressed by selector text.
    ///
    /// Empty selector text addresses the whole tree.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Selector`] if the selector text is malformed.
    /// - Propagate consistency errors from [`CacheEntry::insert`].
    pub fn insert(&mut self, value: &Value, selector: &str) -> Result<(), CacheError> {
        let selectors = crate::selector::parse_selector(selector)?;
        self.root.insert(value, &selectors, &self.store)
    }

    /// Select a value at the position addressed by selector text.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Selector`] if the selector text is malformed.
    /// - Propagate missing-key errors from [`CacheEntry::select`].
    pub fn select(&self, selector: &str) -> Result<Value, CacheError> {
        let selectors = crate::selector::parse_selector(selector)?;
        self.root.select(&selectors)
    }

    /// Whether selector text can be answered without an evaluator call.
    ///
    /// # Errors
    ///
    /// - Return [`CacheError::Selector`] if the selector text is malformed.
    pub fn is_cached(&self, selector: &str) -> Result<bool, CacheError> {
        let selectors = crate::selector::parse_selector(selector)?;
        Ok(self.root.is_cached(&selectors, &self.store))
    }

    /// Record that the leaves addressed by a selection were consumed.
    pub fn mark_path_accessed(&mut self, selectors: &[Selector]) {
        self.root.mark_accessed(selectors);
    }

    /// Whether none of the leaves addressed by a selection were consumed.
    pub fn is_path_unaccessed(&self, selectors: &[Selector]) -> bool {
        self.root.is_unaccessed(selectors)
    }

    /// Persist the cache atomically to the given file.
    ///
    /// Writes to a temporary file in the destination directory, then renames
    /// it over the destination, so concurrent readers always observe either
    /// the old or the new complete document.
    ///
    /// # Errors
    ///
    /// - Return [`CacheFileError::Io`] if the directory cannot be created or
    ///   the temporary file cannot be written or renamed.
    /// - Return [`CacheFileError::Json`] if serialization fails.
    pub fn save_to_file(&self, path: &Path) -> Result<(), CacheFileError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent)?;
                parent
            }
            _ => Path::new("."),
        };

        // INVARIANT: The temporary file lives in the destination directory so
        // the final rename stays on one filesystem.
        let file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(file.as_file(), &json!({ "cache": self.root.as_json() }))?;
        file.persist(path).map_err(|err| err.error)?;

        debug!("saved cache to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory tree with the contents of a cache file.
    ///
    /// # Errors
    ///
    /// - Return [`CacheFileError::Io`] if the file cannot be read.
    /// - Return [`CacheFileError::Json`] if it is not valid JSON.
    /// - Return [`CacheFileError::MissingRoot`] if the document lacks the
    ///   top-level `cache` entry.
    /// - Return [`CacheFileError::Entry`] if the entry shape is malformed.
    pub fn load_from_file(&mut self, path: &Path) -> Result<(), CacheFileError> {
        debug!("loading cache from {}", path.display());
        let data: Value = serde_json::from_str(fs::read_to_string(path)?.as_str())?;
        let root = data.get("cache").ok_or_else(|| CacheFileError::MissingRoot {
            path: path.to_path_buf(),
        })?;

        self.root = CacheEntry::from_json(root)?;
        Ok(())
    }
}

/// Cache persistence error types.
#[derive(Debug, thiserror::Error)]
pub enum CacheFileError {
    /// Cache file cannot be read, written, or renamed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Cache file is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Cache file lacks the top-level `cache` entry.
    #[error("cache file {path:?} is missing its top-level \"cache\" entry")]
    MissingRoot { path: PathBuf },

    /// Cache file entry shape is malformed.
    #[error(transparent)]
    Entry(#[from] CacheError),
}

/// Friendly result alias :3
pub type Result<T, E = CacheFileError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::parse_selector;
    use pretty_assertions::assert_eq;

    #[test]
    fn save_and_load_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("deep").join("cache.json");

        let mut cache = FlakeCache::with_store(ArtifactStore::new("/nix/store"));
        cache.insert(
            &serde_json::json!({ "alpha": { "hostName": "alpha" }, "beta": { "hostName": "beta" } }),
            "machines.*",
        )?;
        cache.save_to_file(&path)?;

        let mut reloaded = FlakeCache::with_store(ArtifactStore::new("/nix/store"));
        reloaded.load_from_file(&path)?;

        assert_eq!(reloaded, cache);
        assert!(reloaded.is_cached("machines.*.hostName")?);
        assert_eq!(
            reloaded.select("machines.*.hostName")?,
            serde_json::json!({ "alpha": "alpha", "beta": "beta" }),
        );
        Ok(())
    }

    #[test]
    fn corrupt_cache_file_reports_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json at all")?;

        let mut cache = FlakeCache::new();
        assert!(matches!(
            cache.load_from_file(&path),
            Err(CacheFileError::Json(_)),
        ));

        std::fs::write(&path, "{\"unrelated\": 1}")?;
        assert!(matches!(
            cache.load_from_file(&path),
            Err(CacheFileError::MissingRoot { .. }),
        ));
        Ok(())
    }

    #[test]
    fn save_overwrites_previous_file_atomically() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.json");

        let mut cache = FlakeCache::new();
        cache.insert(&serde_json::json!(1), "a")?;
        cache.save_to_file(&path)?;
        cache.insert(&serde_json::json!(2), "b")?;
        cache.save_to_file(&path)?;

        let mut reloaded = FlakeCache::new();
        reloaded.load_from_file(&path)?;
        assert_eq!(reloaded.select("a")?, serde_json::json!(1));
        assert_eq!(reloaded.select("b")?, serde_json::json!(2));

        // Only the cache file itself remains, no leftover temporaries.
        let entries = std::fs::read_dir(dir.path())?.count();
        assert_eq!(entries, 1);
        Ok(())
    }

    #[test]
    fn access_marks_flow_through_the_wrapper() -> anyhow::Result<()> {
        let mut cache = FlakeCache::new();
        cache.insert(
            &serde_json::json!({ "a": { "b": "x", "c": "y", "d": "z" } }),
            "",
        )?;

        cache.mark_path_accessed(&parse_selector("a.{b,c}")?);
        assert!(!cache.is_path_unaccessed(&parse_selector("a.b")?));
        assert!(!cache.is_path_unaccessed(&parse_selector("a.c")?));
        assert!(cache.is_path_unaccessed(&parse_selector("a.d")?));
        assert_eq!(cache.root().get("a").unwrap().num_accessed(), 0);

        // Counters are process-lifetime only and vanish on persistence.
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cache.json");
        cache.save_to_file(&path)?;
        let mut reloaded = FlakeCache::new();
        reloaded.load_from_file(&path)?;
        assert!(reloaded.is_path_unaccessed(&parse_selector("a.b")?));
        Ok(())
    }
}
