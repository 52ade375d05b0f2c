// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Determine default absolute path to the per-user cache root.
///
/// Uses XDG Base Directory path `$XDG_CACHE_HOME/oxherd` as the default
/// absolute path for cached evaluation results. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`NoCacheHome`] if the cache directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join("oxherd"))
        .ok_or(NoCacheHome)
}

/// Determine the cache file for one pinned source revision.
///
/// The file name is a deterministic function of the source's content hash,
/// so distinct revisions never collide and stale caches are simply orphaned.
///
/// # Errors
///
/// - Return [`NoCacheHome`] if the cache directory path cannot be determined.
pub fn flake_cache_file(nar_hash: &str) -> Result<PathBuf> {
    Ok(flake_cache_file_in(cache_dir()?.as_path(), nar_hash))
}

/// Determine the cache file for one pinned source revision under an explicit
/// cache root.
pub fn flake_cache_file_in(cache_root: &Path, nar_hash: &str) -> PathBuf {
    let digest = Sha256::digest(nar_hash.as_bytes());
    let name: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    cache_root.join("flakes-v1").join(name)
}

/// No way to determine the user's cache directory.
///
/// # See Also
///
/// - [`dirs::cache_dir`](https://docs.rs/dirs/latest/dirs/fn.cache_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's cache directory")]
pub struct NoCacheHome;

/// Friendly result alias :3
pub type Result<T, E = NoCacheHome> = std::result::Result<T, E>;
