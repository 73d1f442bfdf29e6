//! Lazily populated table of materialized entries.
//!
//! Each mount gets its own cache directory. An entry is copied out of the
//! container the first time it is read or written; after that every stream,
//! channel and descriptor for that path works on the same temp file. Writes
//! mark the item dirty so unmount can turn it into an update.
//!
//! Dropping the cache removes the directory and every temp file in it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::SystemTime;

use tempfile::{TempDir, TempPath};

use super::error::VfsResult;
use super::path;

/// One materialized entry.
#[derive(Debug)]
pub struct FileCacheItem {
    file: TempPath,
    dirty: bool,
}

impl FileCacheItem {
    /// Location of the temp file.
    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Whether the temp file was opened for writing.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current length of the temp file.
    pub fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.file)?.len())
    }

    /// Returns true if the temp file is empty.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Modification time of the temp file.
    pub fn modified(&self) -> io::Result<SystemTime> {
        fs::metadata(&self.file)?.modified()
    }

    /// Access time of the temp file.
    pub fn accessed(&self) -> io::Result<SystemTime> {
        fs::metadata(&self.file)?.accessed()
    }

    /// Creation time of the temp file, where the platform records one.
    pub fn created(&self) -> io::Result<SystemTime> {
        fs::metadata(&self.file)?.created()
    }
}

/// Path-keyed cache of temp files rooted in a scoped directory.
#[derive(Debug)]
pub struct FileCache {
    dir: TempDir,
    items: HashMap<String, FileCacheItem>,
}

impl FileCache {
    /// Create a cache directory, under `parent` if given, else the system
    /// temp directory.
    pub fn new(parent: Option<&Path>) -> VfsResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("arcvfs-");
        let dir = match parent {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!(dir = %dir.path().display(), "created file cache");
        Ok(Self {
            dir,
            items: HashMap::new(),
        })
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing has been materialized.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an already materialized entry.
    pub fn get(&self, path: &str) -> Option<&FileCacheItem> {
        self.items.get(path)
    }

    /// Return the item for `path`, materializing it with `fill` on a miss.
    ///
    /// `fill` receives the freshly created, empty temp file and runs at most
    /// once per path for the lifetime of the cache. If it fails, nothing is
    /// cached and the temp file is removed.
    pub fn get_or_materialize<F>(
        &mut self,
        path: &str,
        for_write: bool,
        fill: F,
    ) -> VfsResult<&FileCacheItem>
    where
        F: FnOnce(&mut File) -> VfsResult<()>,
    {
        if !self.items.contains_key(path) {
            let suffix = path::extension(path::file_name(path));
            let mut named = tempfile::Builder::new()
                .prefix("entry-")
                .suffix(suffix)
                .tempfile_in(self.dir.path())?;
            fill(named.as_file_mut())?;
            named.as_file().sync_all()?;
            let file = named.into_temp_path();
            tracing::debug!(path = %path, file = %file.display(), "materialized entry");
            self.items
                .insert(path.to_string(), FileCacheItem { file, dirty: false });
        }
        let item = self
            .items
            .get_mut(path)
            .ok_or_else(|| io::Error::other("cache item vanished"))?;
        if for_write {
            item.dirty = true;
        }
        Ok(item)
    }

    /// Drop the item for `path` and everything cached below it.
    pub fn remove_subtree(&mut self, root: &str) -> usize {
        let before = self.items.len();
        self.items
            .retain(|key, _| key != root && !path::is_descendant(root, key));
        before - self.items.len()
    }

    /// Re-key items at or below `from` to live under `to`.
    pub fn rekey(&mut self, from: &str, to: &str) {
        let moved: Vec<String> = self
            .items
            .keys()
            .filter(|key| key.as_str() == from || path::is_descendant(from, key))
            .cloned()
            .collect();
        for key in moved {
            if let Some(item) = self.items.remove(&key) {
                self.items.insert(path::rebase(&key, from, to), item);
            }
        }
    }

    /// Paths of dirty items, sorted.
    pub fn dirty_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.dirty)
            .map(|(key, _)| key.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Delete every temp file and the cache directory.
    pub fn purge(self) -> io::Result<()> {
        let Self { dir, items } = self;
        let count = items.len();
        drop(items);
        dir.close()?;
        tracing::debug!(count, "purged file cache");
        Ok(())
    }
}
