//! Process-wide mount registry.
//!
//! Maps a random [`MountId`] and an abstract [`MountPoint`] to a live
//! [`VirtualFileSystem`]. A second index keyed by the parent of each mount
//! point answers "what is mounted under here" queries.
//!
//! Lock order is `filesystems`, then `by_locator`, then `by_parent`. No lock
//! is held while a backend mounts or commits, so a slow container never
//! stalls the rest of the table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use rand::RngCore;

use super::backends::BackendKind;
use super::engine::VirtualFileSystem;
use super::error::{VfsError, VfsResult};
use super::types::{MountId, MountOptions, MountPoint};
use super::uri::VfsUri;
use crate::config::VfsConfig;

static GLOBAL: LazyLock<MountTable> = LazyLock::new(MountTable::new);

/// Summary of one mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Mount id.
    pub id: MountId,
    /// Where the container is visible.
    pub mount_point: MountPoint,
    /// The container file.
    pub container: PathBuf,
    /// Container format.
    pub kind: BackendKind,
    /// Whether this mount is read-only.
    pub read_only: bool,
}

enum Slot {
    /// Id and locator are claimed; the backend is still mounting.
    Reserved,
    Live(Arc<VirtualFileSystem>),
}

enum Reservation {
    Existing(MountId),
    New(MountId),
}

/// Registry of mounted containers.
pub struct MountTable {
    config: VfsConfig,
    filesystems: Mutex<HashMap<MountId, Slot>>,
    by_locator: Mutex<HashMap<MountPoint, MountId>>,
    by_parent: Mutex<HashMap<MountPoint, Vec<MountId>>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("config", &self.config)
            .field("mounts", &"<locked>")
            .finish()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// Create an empty table with default configuration.
    pub fn new() -> Self {
        Self::with_config(VfsConfig::default())
    }

    /// Create an empty table whose mounts use `config`.
    pub fn with_config(config: VfsConfig) -> Self {
        Self {
            config,
            filesystems: Mutex::new(HashMap::new()),
            by_locator: Mutex::new(HashMap::new()),
            by_parent: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide table.
    pub fn global() -> &'static MountTable {
        &GLOBAL
    }

    /// Configuration applied to mounts created by [`mount`](Self::mount).
    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    // ========================================================================
    // Mounting
    // ========================================================================

    /// Mount `container` at `mount_point` with the standard backend of
    /// `kind`.
    ///
    /// Fails with `AlreadyMounted` if the point is taken, unless
    /// `options.remount` is set, in which case the existing id is returned
    /// and the live mount is left as it is.
    pub fn mount(
        &self,
        mount_point: impl Into<MountPoint>,
        container: impl Into<PathBuf>,
        kind: BackendKind,
        options: MountOptions,
    ) -> VfsResult<MountId> {
        let fs = VirtualFileSystem::new(kind, container).with_config(self.config.clone());
        self.mount_fs(mount_point, fs, options)
    }

    /// Mount a caller-constructed instance.
    pub fn mount_fs(
        &self,
        mount_point: impl Into<MountPoint>,
        fs: VirtualFileSystem,
        options: MountOptions,
    ) -> VfsResult<MountId> {
        let mount_point = mount_point.into();
        let id = match self.reserve(&mount_point, options.remount)? {
            Reservation::Existing(id) => {
                tracing::debug!(%id, mount_point = %mount_point, "remount reuses live mount");
                return Ok(id);
            }
            Reservation::New(id) => id,
        };

        let fs = Arc::new(fs);
        if let Err(e) = fs.mount(id, mount_point.clone(), options) {
            self.release(id);
            return Err(e);
        }

        self.filesystems.lock().insert(id, Slot::Live(fs));
        self.by_parent
            .lock()
            .entry(mount_point.parent())
            .or_default()
            .push(id);
        Ok(id)
    }

    fn reserve(&self, mount_point: &MountPoint, remount: bool) -> VfsResult<Reservation> {
        let mut filesystems = self.filesystems.lock();
        let mut by_locator = self.by_locator.lock();
        if let Some(&id) = by_locator.get(mount_point) {
            let live = matches!(filesystems.get(&id), Some(Slot::Live(_)));
            if remount && live {
                return Ok(Reservation::Existing(id));
            }
            return Err(VfsError::already_mounted(mount_point.as_str()));
        }

        let mut rng = rand::thread_rng();
        let id = sample_id(|| rng.next_u32(), |id| filesystems.contains_key(&id));
        filesystems.insert(id, Slot::Reserved);
        by_locator.insert(mount_point.clone(), id);
        Ok(Reservation::New(id))
    }

    fn release(&self, id: MountId) {
        let mut filesystems = self.filesystems.lock();
        let mut by_locator = self.by_locator.lock();
        let mut by_parent = self.by_parent.lock();
        filesystems.remove(&id);
        by_locator.retain(|_, v| *v != id);
        by_parent.retain(|_, ids| {
            ids.retain(|v| *v != id);
            !ids.is_empty()
        });
    }

    /// Unmount `id`, committing pending changes. Unknown ids are ignored.
    ///
    /// The registration disappears before the commit runs, so a failed
    /// commit still leaves the mount point free.
    pub fn unmount(&self, id: MountId) -> VfsResult<()> {
        let fs = match self.filesystems.lock().get(&id) {
            Some(Slot::Live(fs)) => Arc::clone(fs),
            _ => return Ok(()),
        };
        self.release(id);
        fs.unmount()
    }

    /// Unmount everything. Every mount is attempted; the first error is
    /// returned.
    pub fn unmount_all(&self) -> VfsResult<()> {
        let ids: Vec<MountId> = self
            .filesystems
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(id, _)| *id)
            .collect();
        let mut first = None;
        for id in ids {
            if let Err(e) = self.unmount(id) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Move a mount to a new locator without touching its contents.
    pub fn alter_mount_point(
        &self,
        old: impl Into<MountPoint>,
        new: impl Into<MountPoint>,
    ) -> VfsResult<()> {
        let old = old.into();
        let new = new.into();
        if old == new {
            return Ok(());
        }
        let filesystems = self.filesystems.lock();
        let mut by_locator = self.by_locator.lock();
        let mut by_parent = self.by_parent.lock();

        let id = *by_locator.get(&old).ok_or(VfsError::NotMounted)?;
        let Some(Slot::Live(fs)) = filesystems.get(&id) else {
            return Err(VfsError::illegal_state(format!("{old} is still mounting")));
        };
        if by_locator.contains_key(&new) {
            return Err(VfsError::already_mounted(new.as_str()));
        }

        by_locator.remove(&old);
        by_locator.insert(new.clone(), id);
        let old_parent = old.parent();
        if let Some(ids) = by_parent.get_mut(&old_parent) {
            ids.retain(|v| *v != id);
            if ids.is_empty() {
                by_parent.remove(&old_parent);
            }
        }
        by_parent.entry(new.parent()).or_default().push(id);
        fs.set_mount_point(new.clone());
        tracing::info!(%id, from = %old, to = %new, "moved mount point");
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns true if a live mount sits at `locator`.
    pub fn is_mount_point(&self, locator: impl Into<MountPoint>) -> bool {
        self.get_file_system_at(locator).is_some()
    }

    /// The instance mounted as `id`.
    pub fn get_file_system(&self, id: MountId) -> Option<Arc<VirtualFileSystem>> {
        match self.filesystems.lock().get(&id) {
            Some(Slot::Live(fs)) => Some(Arc::clone(fs)),
            _ => None,
        }
    }

    /// The instance mounted at `locator`.
    pub fn get_file_system_at(
        &self,
        locator: impl Into<MountPoint>,
    ) -> Option<Arc<VirtualFileSystem>> {
        let id = self.by_locator.lock().get(&locator.into()).copied()?;
        self.get_file_system(id)
    }

    /// Root address of mount `id`.
    pub fn get_fs_root(&self, id: MountId) -> Option<VfsUri> {
        self.get_file_system(id).map(|_| VfsUri::root(id))
    }

    /// Root address of the mount at `locator`.
    pub fn get_fs_root_at(&self, locator: impl Into<MountPoint>) -> Option<VfsUri> {
        self.get_file_system_at(locator).and_then(|fs| fs.root_uri())
    }

    /// Instances whose mount point lies directly under `parent`.
    pub fn list_file_systems_under(
        &self,
        parent: impl Into<MountPoint>,
    ) -> Vec<Arc<VirtualFileSystem>> {
        let ids = self
            .by_parent
            .lock()
            .get(&parent.into())
            .cloned()
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.get_file_system(id))
            .collect()
    }

    /// Summaries of every live mount, ordered by mount point.
    pub fn list_mounts(&self) -> Vec<MountInfo> {
        let live: Vec<(MountId, Arc<VirtualFileSystem>)> = self
            .filesystems
            .lock()
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(fs) => Some((*id, Arc::clone(fs))),
                Slot::Reserved => None,
            })
            .collect();
        let mut mounts: Vec<MountInfo> = live
            .into_iter()
            .filter_map(|(id, fs)| {
                Some(MountInfo {
                    id,
                    mount_point: fs.mount_point()?,
                    container: fs.container().to_path_buf(),
                    kind: fs.kind(),
                    read_only: fs.is_read_only(),
                })
            })
            .collect();
        mounts.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
        mounts
    }

    /// Find the instance addressed by `uri` and the path inside it.
    pub fn resolve(&self, uri: &VfsUri) -> VfsResult<(Arc<VirtualFileSystem>, String)> {
        let fs = self.get_file_system(uri.id()).ok_or(VfsError::NotMounted)?;
        Ok((fs, uri.path().to_string()))
    }
}

/// Draw ids until one is non-zero and not taken.
fn sample_id(mut next: impl FnMut() -> u32, taken: impl Fn(MountId) -> bool) -> MountId {
    loop {
        if let Some(id) = MountId::new(next()) {
            if !taken(id) {
                return id;
            }
        }
    }
}
