//! Backend contract.
//!
//! A backend adapts one container format to the engine. It builds the
//! initial node tree at mount, decodes entry bytes on demand and, for
//! writable formats, serializes a fresh container at unmount from the
//! original entries plus the journal.
//!
//! The engine serializes every call under its own lock, so backends take
//! `&mut self` freely and only need to be `Send`.

use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use tempfile::NamedTempFile;

use super::backends::BackendKind;
use super::error::{VfsError, VfsResult};
use super::journal::ActionJournal;
use super::node::{Node, NodeTree};
use super::types::{EntryKind, MountOptions};

/// Everything a backend sees while committing.
#[derive(Debug, Clone, Copy)]
pub struct CommitContext<'a> {
    /// Pending actions, in the order they were applied.
    pub journal: &'a ActionJournal,
    /// Whether the mount accepted writes.
    pub read_write: bool,
    /// The original container.
    pub container: &'a Path,
}

impl CommitContext<'_> {
    /// Returns true if a new container should be produced.
    pub fn has_changes(&self) -> bool {
        self.read_write && !self.journal.is_empty()
    }

    /// Create the output file next to the container, so persisting it is a
    /// same-filesystem rename. The file is deleted if dropped unpersisted.
    pub fn create_output(&self) -> VfsResult<NamedTempFile> {
        let dir = match self.container.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let stem = self
            .container
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_string());
        let prefix = format!(".{stem}.");
        Ok(tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)?)
    }
}

/// Format-specific adapter driven by the engine.
pub trait Backend: Send {
    // ========================================================================
    // Identity
    // ========================================================================

    /// Which container format this backend handles.
    fn kind(&self) -> BackendKind;

    /// Location of the container on disk.
    fn container(&self) -> &Path;

    /// Returns false for formats that are never writable, whatever the
    /// mount options say.
    fn supports_write(&self) -> bool {
        true
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Called before the tree is built.
    fn on_pre_mount(&mut self, _options: &MountOptions) -> VfsResult<()> {
        Ok(())
    }

    /// Open the container and build the initial tree.
    ///
    /// Entry names are split into segments, intermediate directories are
    /// created as needed and the descriptor goes only on the leaf.
    fn on_mount(&mut self, options: &MountOptions) -> VfsResult<NodeTree>;

    /// Called once the mount is published.
    fn on_mounted(&mut self) {}

    /// Serialize a new container, or return `None` when there is nothing to
    /// write. Dropping the returned file deletes it.
    fn on_unmount(&mut self, ctx: &CommitContext<'_>) -> VfsResult<Option<NamedTempFile>>;

    // ========================================================================
    // Entries
    // ========================================================================

    /// Refuse paths the format cannot represent.
    fn validate_new_entry(&self, _path: &str, _kind: EntryKind) -> VfsResult<()> {
        Ok(())
    }

    /// Size declared by the container for a node.
    fn declared_size(&self, node: &Node) -> Option<u64> {
        node.descriptor().map(|d| d.size())
    }

    /// Modification time declared by the container for a node.
    fn declared_modified(&self, node: &Node) -> Option<SystemTime> {
        node.descriptor()
            .and_then(|d| d.modified())
            .or_else(|| node.extra_mtime())
    }

    /// Access time declared by the container for a node.
    fn declared_accessed(&self, node: &Node) -> Option<SystemTime> {
        self.declared_modified(node)
    }

    /// Creation time declared by the container for a node.
    fn declared_created(&self, node: &Node) -> Option<SystemTime> {
        self.declared_modified(node)
    }

    /// Decoded content of a physical file node.
    fn open_entry(&mut self, node: &Node) -> VfsResult<Box<dyn Read + '_>>;
}

/// Shorthand for the error returned when a node has no descriptor.
pub(crate) fn missing_descriptor(node: &Node) -> VfsError {
    VfsError::not_found(format!("{} has no container entry", node.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_has_changes_requires_write_and_actions() {
        let mut journal = ActionJournal::new();
        let container = PathBuf::from("/tmp/a.zip");
        let ctx = CommitContext {
            journal: &journal,
            read_write: true,
            container: &container,
        };
        assert!(!ctx.has_changes());

        journal.push(super::super::journal::Action::Create {
            path: "/n".into(),
            kind: EntryKind::File,
        });
        let ctx = CommitContext {
            journal: &journal,
            read_write: false,
            container: &container,
        };
        assert!(!ctx.has_changes());
        let ctx = CommitContext {
            read_write: true,
            ..ctx
        };
        assert!(ctx.has_changes());
    }

    #[test]
    fn test_output_lands_next_to_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("app.zip");
        let journal = ActionJournal::new();
        let ctx = CommitContext {
            journal: &journal,
            read_write: true,
            container: &container,
        };
        let out = ctx.create_output().unwrap();
        assert_eq!(out.path().parent(), Some(dir.path()));
        let name = out.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".app.zip."));
        let path = out.path().to_path_buf();
        drop(out);
        assert!(!path.exists());
    }
}
