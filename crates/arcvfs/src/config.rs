//! Engine configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! cache_dir = "/var/tmp/arcvfs"
//! lookup_cache_capacity = 100
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::vfs::{VfsError, VfsResult};

/// Default capacity of the per-mount path lookup cache.
pub const DEFAULT_LOOKUP_CACHE_CAPACITY: usize = 100;

/// Tunables shared by every mount created from it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Parent directory of per-mount cache directories. System temp if unset.
    pub cache_dir: Option<PathBuf>,
    /// Entries kept in the path lookup cache of each mount.
    pub lookup_cache_capacity: usize,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            lookup_cache_capacity: DEFAULT_LOOKUP_CACHE_CAPACITY,
        }
    }
}

impl VfsConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> VfsResult<Self> {
        toml::from_str(s).map_err(|e| VfsError::invalid_argument(format!("bad config: {e}")))
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> VfsResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    /// Set the cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Set the lookup cache capacity.
    pub fn with_lookup_cache_capacity(mut self, capacity: usize) -> Self {
        self.lookup_cache_capacity = capacity;
        self
    }
}
