//! APK package backend.
//!
//! An APK is a zip archive, so reading is delegated to [`ZipBackend`]. The
//! package view is read-only: nodes carry their DOS timestamp as an `mtime`
//! extra, the root reports the mount time, and commit never produces a file.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::NamedTempFile;

use super::BackendKind;
use super::archive::ZipBackend;
use crate::vfs::error::VfsResult;
use crate::vfs::node::{EXTRA_MTIME, Node, NodeTree, time_to_millis};
use crate::vfs::ops::{Backend, CommitContext};
use crate::vfs::types::MountOptions;

/// Read-only backend for Android packages.
pub struct ApkBackend {
    inner: ZipBackend,
}

impl ApkBackend {
    /// Create a backend for the package at `container`.
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self {
            inner: ZipBackend::new(container),
        }
    }
}

impl Backend for ApkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Package
    }

    fn container(&self) -> &Path {
        self.inner.container()
    }

    fn supports_write(&self) -> bool {
        false
    }

    fn on_mount(&mut self, _options: &MountOptions) -> VfsResult<NodeTree> {
        let mut tree = self.inner.build_tree(|entry, node| match entry.modified_millis() {
            Some(mtime) => node.with_extra(EXTRA_MTIME, mtime),
            None => node,
        })?;
        let root = tree.root();
        if let Some(root) = tree.node_mut(root) {
            root.set_extra(EXTRA_MTIME, time_to_millis(SystemTime::now()));
        }
        Ok(tree)
    }

    fn on_unmount(&mut self, ctx: &CommitContext<'_>) -> VfsResult<Option<NamedTempFile>> {
        if !ctx.journal.is_empty() {
            tracing::warn!(
                container = %self.container().display(),
                actions = ctx.journal.len(),
                "discarding changes to read-only package"
            );
        }
        let readonly = CommitContext {
            read_write: false,
            ..*ctx
        };
        self.inner.on_unmount(&readonly)
    }

    fn declared_modified(&self, node: &Node) -> Option<SystemTime> {
        node.extra_mtime()
    }

    fn open_entry(&mut self, node: &Node) -> VfsResult<Box<dyn Read + '_>> {
        self.inner.open_entry(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::node::millis_to_time;
    use std::fs::File;
    use std::io::Write;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("app.apk");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let opts = SimpleFileOptions::default()
            .last_modified_time(zip::DateTime::from_date_and_time(2020, 5, 17, 8, 30, 10).unwrap());
        zip.start_file("lib/arm64-v8a/libfoo.so", opts).unwrap();
        zip.write_all(b"\x7fELF").unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_mtime_extras() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = ApkBackend::new(fixture(dir.path()));
        let before = SystemTime::now();
        let tree = backend.on_mount(&MountOptions::default()).unwrap();

        let expected = Some(millis_to_time(1_589_704_210_000));
        for path in ["/lib", "/lib/arm64-v8a", "/lib/arm64-v8a/libfoo.so"] {
            let node = tree.node(tree.lookup(path).unwrap()).unwrap();
            assert_eq!(backend.declared_modified(node), expected, "{path}");
        }

        let root = tree.node(tree.root()).unwrap();
        let root_mtime = backend.declared_modified(root).unwrap();
        assert!(root_mtime >= millis_to_time(time_to_millis(before)));
    }

    #[test]
    fn test_never_writable() {
        let dir = tempfile::tempdir().unwrap();
        let container = fixture(dir.path());
        let mut backend = ApkBackend::new(&container);
        assert!(!backend.supports_write());
        backend.on_mount(&MountOptions::read_write()).unwrap();

        let mut journal = crate::vfs::journal::ActionJournal::new();
        journal.push(crate::vfs::journal::Action::Delete {
            path: "/lib".into(),
            kind: crate::vfs::types::EntryKind::Directory,
        });
        let ctx = CommitContext {
            journal: &journal,
            read_write: true,
            container: &container,
        };
        assert!(backend.on_unmount(&ctx).unwrap().is_none());
    }
}
