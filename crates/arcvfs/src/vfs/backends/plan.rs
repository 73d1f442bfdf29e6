//! Path-keyed plan of the container a commit will write.
//!
//! A plan starts from the original entries and absorbs the journal through
//! [`JournalReplay`]. What remains, in path order, is exactly the set of
//! entries to serialize and where each one's bytes come from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::vfs::error::VfsResult;
use crate::vfs::journal::JournalReplay;
use crate::vfs::path;
use crate::vfs::types::EntryKind;

/// Where a planned entry's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedEntry {
    /// Entry `index` of the original container, copied unmodified.
    Original(usize),
    /// Content of a staged temp file.
    Staged(PathBuf),
    /// A file with no content.
    Empty,
    /// A directory with no original record.
    Directory,
}

/// Entries to write, keyed by canonical path.
#[derive(Debug, Default, Clone)]
pub struct CommitPlan {
    entries: BTreeMap<String, PlannedEntry>,
}

impl CommitPlan {
    /// Seed a plan with original entries as `(path, index)` pairs. Backends
    /// reject containers whose entries collide on a path before planning.
    pub fn from_originals<I, S>(originals: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: AsRef<str>,
    {
        let mut entries = BTreeMap::new();
        for (name, index) in originals {
            let path = path::sanitize(name.as_ref());
            if path != path::ROOT {
                entries.insert(path, PlannedEntry::Original(index));
            }
        }
        Self { entries }
    }

    /// Planned entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PlannedEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Look up one entry.
    pub fn get(&self, path: &str) -> Option<&PlannedEntry> {
        self.entries.get(path)
    }

    /// Number of planned entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing will be written.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_subtree(&mut self, root: &str) {
        self.entries
            .retain(|key, _| key != root && !path::is_descendant(root, key));
    }
}

impl JournalReplay for CommitPlan {
    fn create(&mut self, path: &str, kind: EntryKind) -> VfsResult<()> {
        let entry = match kind {
            EntryKind::File => PlannedEntry::Empty,
            EntryKind::Directory => PlannedEntry::Directory,
        };
        self.entries.insert(path.to_string(), entry);
        Ok(())
    }

    fn update(&mut self, path: &str, staged: &Path) -> VfsResult<()> {
        self.entries
            .insert(path.to_string(), PlannedEntry::Staged(staged.to_path_buf()));
        Ok(())
    }

    fn delete(&mut self, path: &str, _kind: EntryKind) -> VfsResult<()> {
        self.remove_subtree(path);
        Ok(())
    }

    // Directory moves arrive as one action per node, parents first, so only
    // the single key moves here.
    fn rename(&mut self, from: &str, to: &str, kind: EntryKind) -> VfsResult<()> {
        let entry = match self.entries.remove(from) {
            Some(entry) => entry,
            None => match kind {
                EntryKind::File => PlannedEntry::Empty,
                EntryKind::Directory => PlannedEntry::Directory,
            },
        };
        self.entries.insert(to.to_string(), entry);
        Ok(())
    }
}
