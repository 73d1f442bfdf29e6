//! The VFS engine: one mounted container.
//!
//! [`VirtualFileSystem`] drives a [`Backend`] through its lifecycle and
//! implements every path operation on top of the node tree, the action
//! journal and the file cache. All state sits behind one mutex, so a single
//! instance serializes its operations while separate mounts proceed
//! independently.
//!
//! Instances are created unmounted and handed to the
//! [`MountTable`](super::MountTable), which owns mounting and unmounting.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use super::backends::BackendKind;
use super::cache::FileCache;
use super::error::{VfsError, VfsResult};
use super::journal::{Action, ActionJournal};
use super::node::{Node, NodeId, NodeTree};
use super::ops::{Backend, CommitContext};
use super::path;
use super::types::{
    AccessMode, EntryKind, MountId, MountOptions, MountPoint, OpenMode, OwnerIdentity, S_IFDIR,
    S_IFREG,
};
use super::uri::VfsUri;
use crate::config::VfsConfig;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsState {
    /// Not mounted; path operations fail.
    Unmounted,
    /// Backend is building the tree.
    Mounting,
    /// Accepting path operations.
    Mounted,
    /// Committing and tearing down.
    Unmounting,
}

#[derive(Debug, Clone, Copy)]
enum Stamp {
    Modified,
    Accessed,
    Created,
}

struct Inner {
    state: FsState,
    options: MountOptions,
    backend: Box<dyn Backend>,
    tree: NodeTree,
    lookup: LruCache<String, NodeId>,
    journal: ActionJournal,
    cache: Option<FileCache>,
}

impl Inner {
    fn writable(&self) -> bool {
        self.options.read_write && self.backend.supports_write()
    }

    /// Resolve a canonical path, consulting the lookup cache first. Only hits
    /// are remembered.
    fn resolve(&mut self, full: &str) -> Option<NodeId> {
        if let Some(id) = self.lookup.get(full).copied() {
            if self.tree.node(id).is_some() {
                return Some(id);
            }
            self.lookup.pop(full);
        }
        let id = self.tree.lookup(full)?;
        self.lookup.put(full.to_string(), id);
        Some(id)
    }

    fn node(&self, id: NodeId) -> VfsResult<&Node> {
        self.tree
            .node(id)
            .ok_or_else(|| VfsError::illegal_state("resolved node was freed"))
    }

    fn require(&mut self, full: &str) -> VfsResult<NodeId> {
        self.resolve(full)
            .ok_or_else(|| VfsError::not_found(full.to_string()))
    }

    fn allows(&self, id: NodeId, mode: AccessMode) -> bool {
        if mode.is_exists() {
            return true;
        }
        let writable = self.writable();
        let is_dir = self.tree.node(id).is_some_and(Node::is_directory);
        if mode.contains(AccessMode::WRITE) && !writable {
            return false;
        }
        if mode.contains(AccessMode::EXECUTE) && !(writable && is_dir) {
            return false;
        }
        true
    }

    fn require_writable(&self, full: &str) -> VfsResult<()> {
        if self.writable() {
            Ok(())
        } else {
            Err(VfsError::access_denied(format!("{full}: mount is read-only")))
        }
    }

    /// Resolve the parent of `full`, which must be an existing directory.
    fn parent_dir(&mut self, full: &str) -> VfsResult<NodeId> {
        let parent = path::parent(full);
        let id = self.require(parent)?;
        if self.node(id)?.is_directory() {
            Ok(id)
        } else {
            Err(VfsError::not_a_directory(parent.to_string()))
        }
    }

    /// Work out which directories `mkdirs(full)` would create, validating
    /// each one, without touching the tree.
    fn plan_mkdirs(&mut self, full: &str) -> VfsResult<Vec<String>> {
        let mut missing = Vec::new();
        let mut current = path::ROOT.to_string();
        for segment in path::segments(full) {
            current = path::join(&current, segment);
            if !missing.is_empty() {
                missing.push(current.clone());
                continue;
            }
            match self.resolve(&current) {
                Some(id) if self.node(id)?.is_directory() => {}
                Some(_) => return Err(VfsError::not_a_directory(current)),
                None => missing.push(current.clone()),
            }
        }
        for dir in &missing {
            self.backend.validate_new_entry(dir, EntryKind::Directory)?;
        }
        Ok(missing)
    }

    /// Add a non-physical node and journal its creation.
    fn create_node(&mut self, full: &str, kind: EntryKind) -> VfsResult<NodeId> {
        let parent = self.parent_dir(full)?;
        let node = Node::of_kind(path::file_name(full), kind, false);
        let id = self.tree.add_child(parent, node)?;
        self.journal.push(Action::Create {
            path: full.to_string(),
            kind,
        });
        Ok(id)
    }

    /// Remove a node and its subtree, dropping cached content.
    fn remove_node(&mut self, full: &str, id: NodeId) -> VfsResult<EntryKind> {
        let kind = self.node(id)?.entry_kind();
        if let Some(cache) = self.cache.as_mut() {
            cache.remove_subtree(full);
        }
        self.tree.remove(id);
        match kind {
            EntryKind::Directory => self.lookup.clear(),
            EntryKind::File => {
                self.lookup.pop(full);
            }
        }
        self.journal.push(Action::Delete {
            path: full.to_string(),
            kind,
        });
        Ok(kind)
    }

    /// Materialize a file node and return its temp file.
    fn cached_file(
        &mut self,
        full: &str,
        id: NodeId,
        for_write: bool,
        cache_parent: Option<&Path>,
    ) -> VfsResult<PathBuf> {
        let node = self.node(id)?;
        if node.is_directory() {
            return Err(VfsError::is_a_directory(full.to_string()));
        }
        let node = node.clone();
        if self.cache.is_none() {
            self.cache = Some(FileCache::new(cache_parent)?);
        }
        let Inner { backend, cache, .. } = self;
        let cache = cache
            .as_mut()
            .ok_or_else(|| VfsError::illegal_state("file cache missing"))?;
        let item = cache.get_or_materialize(full, for_write, |file| {
            if node.is_physical() {
                let mut reader = backend.open_entry(&node)?;
                io::copy(&mut reader, file)?;
            }
            Ok(())
        })?;
        Ok(item.path().to_path_buf())
    }

    /// Turn dirty cache items into trailing update actions.
    fn stage_dirty(&mut self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        for full in cache.dirty_paths() {
            let is_file = self
                .tree
                .lookup(&full)
                .and_then(|id| self.tree.node(id))
                .is_some_and(Node::is_file);
            let Some(item) = cache.get(&full) else {
                continue;
            };
            if is_file {
                self.journal.push(Action::Update {
                    path: full,
                    staged: item.path().to_path_buf(),
                });
            } else {
                tracing::warn!(path = %full, "dropping dirty entry with no file node");
            }
        }
    }

    fn timestamp(&mut self, full: &str, stamp: Stamp) -> VfsResult<SystemTime> {
        let id = self.require(full)?;
        if let Some(item) = self.cache.as_ref().and_then(|c| c.get(full)) {
            let cached = match stamp {
                Stamp::Modified => item.modified(),
                Stamp::Accessed => item.accessed(),
                Stamp::Created => item.created().or_else(|_| item.modified()),
            };
            return Ok(cached?);
        }
        let node = self.node(id)?;
        let declared = match stamp {
            Stamp::Modified => self.backend.declared_modified(node),
            Stamp::Accessed => self.backend.declared_accessed(node),
            Stamp::Created => self.backend.declared_created(node),
        };
        if let Some(time) = declared {
            return Ok(time);
        }
        let meta = fs::metadata(self.backend.container())?;
        let time = match stamp {
            Stamp::Modified => meta.modified(),
            Stamp::Accessed => meta.accessed().or_else(|_| meta.modified()),
            Stamp::Created => meta.created().or_else(|_| meta.modified()),
        };
        Ok(time?)
    }
}

/// One container exposed as a filesystem.
pub struct VirtualFileSystem {
    kind: BackendKind,
    container: PathBuf,
    config: VfsConfig,
    id: AtomicU32,
    mount_point: RwLock<Option<MountPoint>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for VirtualFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFileSystem")
            .field("kind", &self.kind)
            .field("container", &self.container)
            .field("id", &self.id())
            .field("mount_point", &*self.mount_point.read())
            .finish_non_exhaustive()
    }
}

impl VirtualFileSystem {
    /// Create an unmounted instance for `container` using the standard
    /// backend of `kind`.
    pub fn new(kind: BackendKind, container: impl Into<PathBuf>) -> Self {
        Self::with_backend(kind.create_backend(container))
    }

    /// Create an unmounted instance around a caller-supplied backend.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        let config = VfsConfig::default();
        Self {
            kind: backend.kind(),
            container: backend.container().to_path_buf(),
            id: AtomicU32::new(0),
            mount_point: RwLock::new(None),
            inner: Mutex::new(Inner {
                state: FsState::Unmounted,
                options: MountOptions::default(),
                backend,
                tree: NodeTree::new(),
                lookup: LruCache::new(lookup_capacity(&config)),
                journal: ActionJournal::new(),
                cache: None,
            }),
            config,
        }
    }

    /// Replace the configuration. Only meaningful before mounting.
    pub fn with_config(mut self, config: VfsConfig) -> Self {
        self.inner.get_mut().lookup = LruCache::new(lookup_capacity(&config));
        self.config = config;
        self
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// Container format.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The container file.
    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Mount id, while mounted.
    pub fn id(&self) -> Option<MountId> {
        MountId::new(self.id.load(Ordering::Acquire))
    }

    /// Mount point, while mounted.
    pub fn mount_point(&self) -> Option<MountPoint> {
        self.mount_point.read().clone()
    }

    /// `vfs://<id>/`, while mounted.
    pub fn root_uri(&self) -> Option<VfsUri> {
        self.id().map(VfsUri::root)
    }

    /// Lifecycle state.
    pub fn state(&self) -> FsState {
        self.inner.lock().state
    }

    /// Returns true while path operations are accepted.
    pub fn is_mounted(&self) -> bool {
        self.state() == FsState::Mounted
    }

    /// Options the instance was mounted with.
    pub fn options(&self) -> MountOptions {
        self.inner.lock().options.clone()
    }

    /// Returns true unless the mount accepts writes.
    pub fn is_read_only(&self) -> bool {
        !self.inner.lock().writable()
    }

    /// Snapshot of the pending journal.
    pub fn pending_actions(&self) -> VfsResult<Vec<Action>> {
        self.with_mounted(|inner| Ok(inner.journal.iter().cloned().collect()))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub(crate) fn mount(
        &self,
        id: MountId,
        mount_point: MountPoint,
        options: MountOptions,
    ) -> VfsResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != FsState::Unmounted {
            return Err(VfsError::illegal_state(format!(
                "{} is already mounted",
                self.container.display()
            )));
        }
        inner.state = FsState::Mounting;
        let built = inner
            .backend
            .on_pre_mount(&options)
            .and_then(|()| inner.backend.on_mount(&options));
        let tree = match built {
            Ok(tree) => tree,
            Err(e) => {
                inner.state = FsState::Unmounted;
                tracing::warn!(
                    container = %self.container.display(),
                    error = %e,
                    "mount failed"
                );
                return Err(e);
            }
        };
        let nodes = tree.len();
        inner.tree = tree;
        inner.lookup.clear();
        inner.journal.clear();
        inner.options = options;
        inner.state = FsState::Mounted;
        self.id.store(id.get(), Ordering::Release);
        *self.mount_point.write() = Some(mount_point.clone());
        inner.backend.on_mounted();
        tracing::info!(
            %id,
            mount_point = %mount_point,
            kind = %self.kind,
            nodes,
            "mounted"
        );
        Ok(())
    }

    /// Commit pending changes and tear everything down. A no-op unless
    /// mounted.
    pub(crate) fn unmount(&self) -> VfsResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != FsState::Mounted {
            return Ok(());
        }
        inner.state = FsState::Unmounting;
        let id = self.id.swap(0, Ordering::AcqRel);

        inner.stage_dirty();
        let read_write = inner.writable();
        let committed = {
            let Inner {
                backend, journal, ..
            } = &mut *inner;
            let ctx = CommitContext {
                journal,
                read_write,
                container: &self.container,
            };
            backend.on_unmount(&ctx)
        };

        let actions = inner.journal.len();
        if let Some(cache) = inner.cache.take() {
            if let Err(e) = cache.purge() {
                tracing::warn!(id, error = %e, "failed to remove file cache");
            }
        }
        inner.journal.clear();
        inner.tree = NodeTree::new();
        inner.lookup.clear();
        inner.state = FsState::Unmounted;
        let callback = inner.options.on_unmount.clone();
        drop(inner);
        *self.mount_point.write() = None;

        match committed {
            Ok(None) => {
                tracing::info!(id, "unmounted");
                Ok(())
            }
            Ok(Some(output)) => {
                match callback {
                    Some(callback) => {
                        let path = output
                            .into_temp_path()
                            .keep()
                            .map_err(|e| VfsError::Io(e.error))?;
                        callback(&self.container, path);
                    }
                    None => {
                        output
                            .persist(&self.container)
                            .map_err(|e| VfsError::Io(e.error))?;
                    }
                }
                tracing::info!(
                    id,
                    actions,
                    container = %self.container.display(),
                    "committed and unmounted"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    id,
                    container = %self.container.display(),
                    error = %e,
                    "commit failed, container left untouched"
                );
                Err(e)
            }
        }
    }

    pub(crate) fn set_mount_point(&self, mount_point: MountPoint) {
        *self.mount_point.write() = Some(mount_point);
    }

    fn with_mounted<T>(&self, f: impl FnOnce(&mut Inner) -> VfsResult<T>) -> VfsResult<T> {
        let mut inner = self.inner.lock();
        if inner.state != FsState::Mounted {
            return Err(VfsError::NotMounted);
        }
        f(&mut inner)
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    /// Returns true if `path` exists.
    pub fn exists(&self, path: &str) -> VfsResult<bool> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| Ok(inner.resolve(&full).is_some()))
    }

    /// Returns true if `path` is a directory.
    pub fn is_directory(&self, path: &str) -> VfsResult<bool> {
        self.test_node(path, Node::is_directory)
    }

    /// Returns true if `path` is a file.
    pub fn is_file(&self, path: &str) -> VfsResult<bool> {
        self.test_node(path, Node::is_file)
    }

    /// Returns true if `path` exists and its name starts with a dot.
    pub fn is_hidden(&self, path: &str) -> VfsResult<bool> {
        self.test_node(path, |node| node.name().starts_with('.'))
    }

    fn test_node(&self, path: &str, test: impl FnOnce(&Node) -> bool) -> VfsResult<bool> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            Ok(inner
                .resolve(&full)
                .and_then(|id| inner.tree.node(id))
                .is_some_and(test))
        })
    }

    /// Check whether `mode` access to `path` would be granted.
    ///
    /// Every mode requires the path to exist. Writes need a writable mount;
    /// execute is only granted for directories on writable mounts.
    pub fn check_access(&self, path: &str, mode: AccessMode) -> VfsResult<bool> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| match inner.resolve(&full) {
            Some(id) => Ok(inner.allows(id, mode)),
            None => Ok(false),
        })
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Length in bytes. Directories report 0.
    pub fn length(&self, path: &str) -> VfsResult<u64> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            let id = inner.require(&full)?;
            let node = inner.node(id)?;
            if node.is_directory() {
                return Ok(0);
            }
            if let Some(item) = inner.cache.as_ref().and_then(|c| c.get(&full)) {
                return Ok(item.len()?);
            }
            if let Some(size) = inner.backend.declared_size(node) {
                return Ok(size);
            }
            if !node.is_physical() {
                return Ok(0);
            }
            Err(VfsError::not_found(format!("{full} has no declared size")))
        })
    }

    /// Last modification time.
    pub fn last_modified(&self, path: &str) -> VfsResult<SystemTime> {
        self.stamp(path, Stamp::Modified)
    }

    /// Last access time.
    pub fn last_access(&self, path: &str) -> VfsResult<SystemTime> {
        self.stamp(path, Stamp::Accessed)
    }

    /// Creation time.
    pub fn creation_time(&self, path: &str) -> VfsResult<SystemTime> {
        self.stamp(path, Stamp::Created)
    }

    fn stamp(&self, path: &str, stamp: Stamp) -> VfsResult<SystemTime> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| inner.timestamp(&full, stamp))
    }

    /// `st_mode` style type and permission bits.
    pub fn get_mode(&self, path: &str) -> VfsResult<u32> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            let id = inner.require(&full)?;
            let writable = inner.writable();
            let mut bits = inner.options.mode;
            if !writable {
                bits &= !0o222;
            }
            if inner.node(id)?.is_directory() {
                if writable {
                    bits |= 0o111;
                }
                Ok(S_IFDIR | bits)
            } else {
                Ok(S_IFREG | bits)
            }
        })
    }

    /// Owner reported for `path`, if the mount was given one.
    pub fn get_owner_identity(&self, path: &str) -> VfsResult<Option<OwnerIdentity>> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            inner.require(&full)?;
            Ok(inner.options.owner)
        })
    }

    /// Child names of a directory, sorted. `None` if `path` is missing or
    /// not a directory.
    pub fn list(&self, path: &str) -> VfsResult<Option<Vec<String>>> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            let Some(id) = inner.resolve(&full) else {
                return Ok(None);
            };
            if !inner.node(id)?.is_directory() {
                return Ok(None);
            }
            let names = inner
                .tree
                .children(id)
                .filter_map(|child| inner.tree.node(child))
                .map(|node| node.name().to_string())
                .collect();
            Ok(Some(names))
        })
    }

    // ========================================================================
    // Structural mutation
    // ========================================================================

    /// Create an empty file. The parent must exist.
    pub fn create_new_file(&self, path: &str) -> VfsResult<()> {
        self.create(path, EntryKind::File)
    }

    /// Create a directory. The parent must exist.
    pub fn mkdir(&self, path: &str) -> VfsResult<()> {
        self.create(path, EntryKind::Directory)
    }

    fn create(&self, path: &str, kind: EntryKind) -> VfsResult<()> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            inner.require_writable(&full)?;
            if inner.resolve(&full).is_some() {
                return Err(VfsError::already_exists(full.clone()));
            }
            inner.parent_dir(&full)?;
            inner.backend.validate_new_entry(&full, kind)?;
            inner.create_node(&full, kind)?;
            tracing::debug!(path = %full, ?kind, "created");
            Ok(())
        })
    }

    /// Create a directory and any missing parents. Succeeds if it already
    /// exists as a directory.
    pub fn mkdirs(&self, path: &str) -> VfsResult<()> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            let missing = inner.plan_mkdirs(&full)?;
            if missing.is_empty() {
                return Ok(());
            }
            inner.require_writable(&full)?;
            for dir in &missing {
                inner.create_node(dir, EntryKind::Directory)?;
            }
            tracing::debug!(path = %full, created = missing.len(), "mkdirs");
            Ok(())
        })
    }

    /// Delete a file or a directory with everything below it.
    ///
    /// Returns false, journaling nothing, if `path` does not exist.
    pub fn delete(&self, path: &str) -> VfsResult<bool> {
        let full = path::sanitize(path);
        self.with_mounted(|inner| {
            inner.require_writable(&full)?;
            if full == path::ROOT {
                return Err(VfsError::invalid_path("cannot delete the root"));
            }
            let Some(id) = inner.resolve(&full) else {
                return Ok(false);
            };
            let kind = inner.remove_node(&full, id)?;
            tracing::debug!(path = %full, ?kind, "deleted");
            Ok(true)
        })
    }

    /// Move `src` to `dst`.
    ///
    /// Missing parents of `dst` are created. An existing `dst` is replaced
    /// only if it is a file (for a file source) or an empty directory (for a
    /// directory source). Directories move with their whole subtree and
    /// journal one move per node, parents first.
    pub fn rename_to(&self, src: &str, dst: &str) -> VfsResult<()> {
        let src = path::sanitize(src);
        let dst = path::sanitize(dst);
        self.with_mounted(|inner| {
            inner.require_writable(&src)?;
            if src == path::ROOT || dst == path::ROOT {
                return Err(VfsError::invalid_path("cannot move the root"));
            }
            if src == dst {
                return Err(VfsError::invalid_argument(format!(
                    "{src} cannot be moved onto itself"
                )));
            }
            if path::is_descendant(&src, &dst) {
                return Err(VfsError::invalid_argument(format!(
                    "{src} cannot be moved into its own subtree {dst}"
                )));
            }
            let src_id = inner.require(&src)?;
            let kind = inner.node(src_id)?.entry_kind();

            let replaced = match inner.resolve(&dst) {
                Some(dst_id) => {
                    let target = inner.node(dst_id)?;
                    match (kind, target.entry_kind()) {
                        (EntryKind::Directory, EntryKind::File) => {
                            return Err(VfsError::not_a_directory(dst.clone()));
                        }
                        (EntryKind::File, EntryKind::Directory) => {
                            return Err(VfsError::is_a_directory(dst.clone()));
                        }
                        (EntryKind::Directory, EntryKind::Directory)
                            if target.child_count() > 0 =>
                        {
                            return Err(VfsError::directory_not_empty(dst.clone()));
                        }
                        _ => Some(dst_id),
                    }
                }
                None => None,
            };
            inner.backend.validate_new_entry(&dst, kind)?;
            let missing_parents = inner.plan_mkdirs(path::parent(&dst))?;

            if let Some(dst_id) = replaced {
                inner.remove_node(&dst, dst_id)?;
            }
            for dir in &missing_parents {
                inner.create_node(dir, EntryKind::Directory)?;
            }

            let moved: Vec<(NodeId, String, EntryKind)> = inner
                .tree
                .subtree(src_id)
                .into_iter()
                .filter_map(|id| {
                    let node = inner.tree.node(id)?;
                    Some((id, inner.tree.full_path(id), node.entry_kind()))
                })
                .collect();
            let new_parent = inner.parent_dir(&dst)?;
            inner.tree.detach(src_id)?;
            inner.tree.attach(new_parent, src_id, path::file_name(&dst))?;

            for (id, from, node_kind) in moved {
                let to = path::rebase(&from, &src, &dst);
                let actual = inner.tree.full_path(id);
                if actual != to {
                    return Err(VfsError::illegal_state(format!(
                        "moved node {from} ended up at {actual}, expected {to}"
                    )));
                }
                inner.journal.push(Action::Move {
                    from,
                    to,
                    kind: node_kind,
                });
            }
            if let Some(cache) = inner.cache.as_mut() {
                cache.rekey(&src, &dst);
            }
            match kind {
                EntryKind::Directory => inner.lookup.clear(),
                EntryKind::File => {
                    inner.lookup.pop(&src);
                    inner.lookup.pop(&dst);
                }
            }
            tracing::debug!(from = %src, to = %dst, ?kind, "renamed");
            Ok(())
        })
    }

    // ========================================================================
    // I/O
    // ========================================================================

    fn open_checked(&self, path: &str, mode: OpenMode) -> VfsResult<PathBuf> {
        mode.validate()?;
        let full = path::sanitize(path);
        let cache_parent = self.config.cache_dir.clone();
        self.with_mounted(|inner| {
            let id = inner.require(&full)?;
            if !inner.allows(id, mode.access()) {
                return Err(VfsError::access_denied(full.clone()));
            }
            inner.cached_file(&full, id, mode.write, cache_parent.as_deref())
        })
    }

    /// Open a file for reading.
    pub fn new_input_stream(&self, path: &str) -> VfsResult<File> {
        let cached = self.open_checked(path, OpenMode::read_only())?;
        Ok(File::open(cached)?)
    }

    /// Open a file for writing, truncating unless `append` is set.
    pub fn new_output_stream(&self, path: &str, append: bool) -> VfsResult<File> {
        let mode = if append {
            OpenMode::write_only().with_append()
        } else {
            OpenMode::write_only().with_truncate()
        };
        self.open_channel(path, mode)
    }

    /// Open a seekable handle with the given mode.
    pub fn open_channel(&self, path: &str, mode: OpenMode) -> VfsResult<File> {
        let cached = self.open_checked(path, mode)?;
        let file = OpenOptions::new()
            .read(mode.read)
            .write(mode.write && !mode.append)
            .append(mode.append)
            .truncate(mode.truncate && !mode.append)
            .open(cached)?;
        Ok(file)
    }

    /// Open a raw descriptor. `mode` is one of `r`, `w`, `wt`, `wa`, `rw`,
    /// `rwt`.
    #[cfg(unix)]
    pub fn open_file_descriptor(&self, path: &str, mode: &str) -> VfsResult<std::os::fd::OwnedFd> {
        let mode = OpenMode::parse(mode)?;
        Ok(self.open_channel(path, mode)?.into())
    }
}

fn lookup_capacity(config: &VfsConfig) -> NonZeroUsize {
    NonZeroUsize::new(config.lookup_cache_capacity).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("t.zip");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        let opts = SimpleFileOptions::default();
        zip.start_file("a/x.txt", opts).unwrap();
        zip.write_all(b"xx").unwrap();
        zip.start_file("a/y/z.txt", opts).unwrap();
        zip.write_all(b"zzz").unwrap();
        zip.start_file(".hidden", opts).unwrap();
        zip.finish().unwrap();
        path
    }

    fn mounted(dir: &Path, options: MountOptions) -> VirtualFileSystem {
        let vfs = VirtualFileSystem::new(BackendKind::Archive, fixture(dir));
        vfs.mount(MountId::new(1).unwrap(), MountPoint::new("/m"), options)
            .unwrap();
        vfs
    }

    #[test]
    fn test_not_mounted() {
        let vfs = VirtualFileSystem::new(BackendKind::Archive, "/nonexistent.zip");
        assert!(matches!(vfs.exists("/"), Err(VfsError::NotMounted)));
        assert!(vfs.unmount().is_ok());
    }

    #[test]
    fn test_predicates() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::default());
        assert!(vfs.is_directory("/a").unwrap());
        assert!(vfs.is_file("a/x.txt").unwrap());
        assert!(vfs.is_hidden("/.hidden").unwrap());
        assert!(!vfs.is_hidden("/a").unwrap());
        assert!(!vfs.is_file("/missing").unwrap());
        assert_eq!(vfs.root_uri().unwrap().to_string(), "vfs://1/");
    }

    #[test]
    fn test_access_on_read_only_mount() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::default());
        assert!(vfs.check_access("/a/x.txt", AccessMode::READ).unwrap());
        assert!(!vfs.check_access("/a/x.txt", AccessMode::WRITE).unwrap());
        assert!(!vfs.check_access("/a", AccessMode::EXECUTE).unwrap());
        assert!(!vfs.check_access("/missing", AccessMode::READ).unwrap());
        assert!(matches!(
            vfs.create_new_file("/new"),
            Err(VfsError::AccessDenied(_))
        ));
        assert!(matches!(
            vfs.new_output_stream("/a/x.txt", false),
            Err(VfsError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_access_on_writable_mount() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        let rwx = AccessMode::READ | AccessMode::WRITE | AccessMode::EXECUTE;
        assert!(vfs.check_access("/a", rwx).unwrap());
        assert!(!vfs.check_access("/a/x.txt", AccessMode::EXECUTE).unwrap());
    }

    #[test]
    fn test_mode_bits() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::default());
        assert_eq!(vfs.get_mode("/a").unwrap(), S_IFDIR | 0o444);
        assert_eq!(vfs.get_mode("/a/x.txt").unwrap(), S_IFREG | 0o444);

        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write().with_mode(0o640));
        assert_eq!(vfs.get_mode("/a").unwrap(), S_IFDIR | 0o751);
        assert_eq!(vfs.get_mode("/a/x.txt").unwrap(), S_IFREG | 0o640);
        assert!(matches!(vfs.get_mode("/nope"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_length_rules() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        assert_eq!(vfs.length("/a").unwrap(), 0);
        assert_eq!(vfs.length("/a/y/z.txt").unwrap(), 3);
        vfs.create_new_file("/a/new.txt").unwrap();
        assert_eq!(vfs.length("/a/new.txt").unwrap(), 0);

        let mut out = vfs.new_output_stream("/a/new.txt", false).unwrap();
        out.write_all(b"12345").unwrap();
        drop(out);
        assert_eq!(vfs.length("/a/new.txt").unwrap(), 5);
        assert!(matches!(vfs.length("/nope"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_delete_then_recreate_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        let mut body = String::new();
        vfs.new_input_stream("/a/x.txt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "xx");

        assert!(vfs.delete("/a/x.txt").unwrap());
        vfs.create_new_file("/a/x.txt").unwrap();
        assert_eq!(vfs.length("/a/x.txt").unwrap(), 0);
        let mut body = String::new();
        vfs.new_input_stream("/a/x.txt")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_create_errors() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        assert!(matches!(
            vfs.create_new_file("/a/x.txt"),
            Err(VfsError::AlreadyExists(_))
        ));
        assert!(matches!(
            vfs.mkdir("/missing/dir"),
            Err(VfsError::NotFound(_))
        ));
        assert!(matches!(
            vfs.mkdir("/a/x.txt/dir"),
            Err(VfsError::NotADirectory(_))
        ));
        assert!(vfs.pending_actions().unwrap().is_empty());
    }

    #[test]
    fn test_mkdirs_journals_each_level() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        vfs.mkdirs("/a/p/q/r").unwrap();
        assert!(vfs.is_directory("/a/p/q/r").unwrap());
        assert_eq!(vfs.pending_actions().unwrap().len(), 3);
        vfs.mkdirs("/a/p").unwrap();
        assert_eq!(vfs.pending_actions().unwrap().len(), 3);
    }

    #[test]
    fn test_rename_replaces_file_destination() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        vfs.rename_to("/a/y/z.txt", "/a/x.txt").unwrap();
        assert_eq!(vfs.length("/a/x.txt").unwrap(), 3);
        assert!(!vfs.exists("/a/y/z.txt").unwrap());
        let actions = vfs.pending_actions().unwrap();
        assert!(matches!(actions[0], Action::Delete { .. }));
        assert!(matches!(actions[1], Action::Move { .. }));
    }

    #[test]
    fn test_rename_refuses_non_empty_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        vfs.mkdir("/b").unwrap();
        vfs.create_new_file("/b/keep").unwrap();
        assert!(matches!(
            vfs.rename_to("/a", "/b"),
            Err(VfsError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            vfs.rename_to("/a/x.txt", "/b"),
            Err(VfsError::IsADirectory(_))
        ));
    }

    #[test]
    fn test_rename_carries_cached_content() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        let mut out = vfs.new_output_stream("/a/x.txt", true).unwrap();
        out.write_all(b"!").unwrap();
        drop(out);
        vfs.rename_to("/a", "/moved/deeper").unwrap();
        assert_eq!(vfs.length("/moved/deeper/x.txt").unwrap(), 3);
        assert_eq!(vfs.list("/moved").unwrap(), Some(vec!["deeper".to_string()]));
    }

    #[test]
    fn test_list() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::default());
        assert_eq!(
            vfs.list("/").unwrap(),
            Some(vec![".hidden".to_string(), "a".to_string()])
        );
        assert_eq!(vfs.list("/a/x.txt").unwrap(), None);
        assert_eq!(vfs.list("/missing").unwrap(), None);
    }

    #[test]
    fn test_timestamps_fall_back_to_container() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::default());
        let container_mtime = fs::metadata(vfs.container()).unwrap().modified().unwrap();
        assert_eq!(vfs.last_modified("/a").unwrap(), container_mtime);
        assert!(vfs.last_modified("/a/x.txt").is_ok());
        assert!(matches!(
            vfs.creation_time("/nope"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_owner_identity() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(
            dir.path(),
            MountOptions::default().with_owner(OwnerIdentity::new(10, 20)),
        );
        assert_eq!(
            vfs.get_owner_identity("/a").unwrap(),
            Some(OwnerIdentity::new(10, 20))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_file_descriptor_modes() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = mounted(dir.path(), MountOptions::read_write());
        let fd = vfs.open_file_descriptor("/a/x.txt", "r").unwrap();
        let mut body = String::new();
        File::from(fd).read_to_string(&mut body).unwrap();
        assert_eq!(body, "xx");
        assert!(matches!(
            vfs.open_file_descriptor("/a/x.txt", "q"),
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            vfs.open_file_descriptor("/a", "r"),
            Err(VfsError::IsADirectory(_))
        ));
    }
}
