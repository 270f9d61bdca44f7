//! Content-addressed unpack cache.
//!
//! Cached entries are keyed by image digest and hold the materialized
//! form of the image:
//!
//! ```text
//! <cache-root>/<digest-hex>/
//!   manifest.json
//!   config.json
//!   layers/<layer-digest>/...     (when layers were materialized)
//!   flat/...                      (flattened filesystem)
//! ```
//!
//! Writers build an entry in a staging directory under the same root and
//! promote it with an atomic rename, so concurrent writers of the same
//! digest are safe: one rename wins, losers observe the existing entry
//! and reuse it. Reads are lock-free. The cache is not size-bounded;
//! `purge` is explicit.

use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use shale_core::error::{Result, ShaleError};

/// On-disk unpack cache keyed by image digest.
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    /// Open (creating if needed) a cache at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            ShaleError::Cache(format!(
                "failed to create cache root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    /// The default cache root: `$SHALE_CACHE_DIR`, else
    /// `$XDG_CACHE_HOME/shale`, else `$HOME/.cache/shale`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var("SHALE_CACHE_DIR") {
            return PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
            return PathBuf::from(dir).join("shale");
        }
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".cache").join("shale"),
            Err(_) => std::env::temp_dir().join("shale-cache"),
        }
    }

    /// The entry directory for a digest, whether or not it exists.
    pub fn entry_path(&self, digest: &str) -> PathBuf {
        self.root.join(digest_hex(digest))
    }

    /// Look up a cached entry. Returns the entry directory on hit.
    pub fn get(&self, digest: &str) -> Option<PathBuf> {
        let entry = self.entry_path(digest);
        if entry.join("flat").is_dir() {
            tracing::debug!(digest = %digest, "Cache hit");
            Some(entry)
        } else {
            None
        }
    }

    /// A fresh staging directory on the same filesystem as the cache, for
    /// building an entry prior to [`ImageCache::put`].
    pub fn staging_dir(&self, digest: &str) -> Result<PathBuf> {
        let suffix: String = (&mut OsRng)
            .sample_iter(Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let dir = self
            .root
            .join("tmp")
            .join(format!("{}-{}", digest_hex(digest), suffix));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Promote a staged tree to the entry for `digest`.
    ///
    /// Single writer wins via atomic rename; a losing writer's staging
    /// tree is discarded and the winner's entry returned.
    pub fn put(&self, digest: &str, staged: &Path) -> Result<PathBuf> {
        let entry = self.entry_path(digest);
        if entry.exists() {
            let _ = std::fs::remove_dir_all(staged);
            return Ok(entry);
        }
        match std::fs::rename(staged, &entry) {
            Ok(()) => {
                tracing::debug!(digest = %digest, entry = %entry.display(), "Cache entry stored");
                Ok(entry)
            }
            Err(_) if entry.exists() => {
                // Lost the race; reuse the winner's entry
                let _ = std::fs::remove_dir_all(staged);
                Ok(entry)
            }
            Err(e) => Err(ShaleError::Cache(format!(
                "failed to store cache entry {}: {}",
                entry.display(),
                e
            ))),
        }
    }

    /// Remove every cached entry.
    pub fn purge(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        for child in std::fs::read_dir(&self.root)? {
            let path = child?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path).map_err(|e| {
                    ShaleError::Cache(format!("failed to purge {}: {}", path.display(), e))
                })?;
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
        tracing::info!(root = %self.root.display(), "Cache purged");
        Ok(())
    }
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}
