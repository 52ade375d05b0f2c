// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Artifact store path detection and existence checks.
//!
//! Evaluated fleet attributes frequently reference content-addressed
//! artifacts by their physical location under the store root, e.g.
//! `/nix/store/<hash>-<name>`. Cached copies of such references are only
//! trustworthy while the artifact itself survives: the store is garbage
//! collected out-of-band, and a collected artifact must be re-evaluated
//! rather than served from cache. This module decides which cached scalars
//! carry store references and whether those references still resolve.
//!
//! Diagnostic strings are the one tricky case. Evaluator messages often cite
//! positions as `<store path>/module.nix:12:5`. Those are not store-path
//! values and must be stored verbatim, but their embedded reference can still
//! be existence-checked once the `:LINE:COL` suffix is trimmed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Trailing `:LINE` or `:LINE:COL` position suffix on diagnostic strings.
static DIAG_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+(:\d+)?$").unwrap());

/// Content-addressed artifact store rooted at one directory.
///
/// The root defaults to `/nix/store`, overridable through `NIX_STORE_DIR` so
/// relocated test stores are checked against the store actually in use.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    store_dir: PathBuf,
    reference: Regex,
}

impl ArtifactStore {
    /// Construct a store rooted at the given directory.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        let store_dir = store_dir.into();
        let escaped = regex::escape(store_dir.to_string_lossy().as_ref());
        // INVARIANT: A reference runs from the store root to the first
        // whitespace or quote character.
        let reference = Regex::new(&format!(r#"{escaped}/[^\s"']+"#)).unwrap();

        Self {
            store_dir,
            reference,
        }
    }

    /// Construct a store from the process environment.
    ///
    /// Honors `NIX_STORE_DIR` when set, otherwise falls back to the standard
    /// `/nix/store` root.
    pub fn from_env() -> Self {
        match std::env::var_os("NIX_STORE_DIR") {
            Some(dir) => Self::new(PathBuf::from(dir)),
            None => Self::new("/nix/store"),
        }
    }

    /// Root directory of this store.
    pub fn store_dir(&self) -> &Path {
        self.store_dir.as_path()
    }

    /// Whether the entire string is a single store path.
    ///
    /// Strings carrying a trailing `:LINE` or `:LINE:COL` diagnostic suffix
    /// are positions inside a stored file, not store-path values.
    pub fn is_store_path(&self, value: &str) -> bool {
        let Some(rest) = value.strip_prefix(self.store_dir.to_string_lossy().as_ref()) else {
            return false;
        };
        let Some(name) = rest.strip_prefix('/') else {
            return false;
        };

        !name.is_empty()
            && !name.chars().any(char::is_whitespace)
            && !DIAG_SUFFIX.is_match(value)
    }

    /// Every store reference embedded in the string.
    ///
    /// Diagnostic position suffixes are trimmed from each match so the
    /// referenced file itself is what gets existence-checked.
    pub fn references(&self, value: &str) -> Vec<PathBuf> {
        self.reference
            .find_iter(value)
            .map(|found| PathBuf::from(DIAG_SUFFIX.replace(found.as_str(), "").into_owned()))
            .collect()
    }

    /// Whether every store reference embedded in the string still exists.
    ///
    /// Strings without references trivially pass. A failed check means the
    /// referenced artifact was garbage collected after the value was cached.
    pub fn references_exist(&self, value: &str) -> bool {
        self.references(value).iter().all(|path| path.exists())
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::from_env()
    }
}
