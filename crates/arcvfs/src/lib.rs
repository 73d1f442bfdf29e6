//! # arcvfs
//!
//! Mount zip archives, class packs and apk files as filesystems.
//!
//! ```no_run
//! use arcvfs::{BackendKind, MountOptions, MountTable};
//!
//! # fn main() -> arcvfs::VfsResult<()> {
//! let table = MountTable::global();
//! let id = table.mount("/work/app.zip", "app.zip", BackendKind::Archive, MountOptions::read_write())?;
//! let fs = table.get_file_system(id).expect("just mounted");
//! fs.mkdirs("/assets/images")?;
//! fs.rename_to("/logo.png", "/assets/images/logo.png")?;
//! table.unmount(id)?; // writes a new app.zip
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod vfs;

pub use config::VfsConfig;
pub use vfs::{
    AccessMode, Action, ActionJournal, Backend, BackendKind, CommitContext, EntryKind, FsState,
    MountId, MountInfo, MountOptions, MountPoint, MountTable, MountWorker, OpenMode,
    OwnerIdentity, VfsError, VfsResult, VfsUri, VirtualFileSystem,
};
