//! Overlay filesystem over container files.
//!
//! A container (zip archive, class pack, apk) is mounted at an abstract
//! mount point and then behaves like a directory tree. Edits never touch the
//! container in place: they go to an in-memory tree, a journal of actions and
//! a per-mount cache of temp files. Unmounting a writable mount replays the
//! journal into a brand new container that atomically replaces the original.
//!
//! Key components:
//!
//! - [`MountTable`] - Registry of live mounts, keyed by id and mount point
//! - [`VirtualFileSystem`] - The per-mount engine and path API
//! - [`Backend`] - Format adapter, one per [`BackendKind`]
//! - [`NodeTree`] - Arena-backed directory tree
//! - [`ActionJournal`] - Pending changes, replayed at commit
//! - [`MountWorker`] - Runs blocking calls on tokio's blocking pool
//!
//! ## Design Decisions
//!
//! - **Copy on first touch**: entry bytes are copied to a temp file the first
//!   time they are opened and every handle shares that file afterwards.
//! - **Rebuild, never patch**: commit streams unchanged entries from the old
//!   container and staged ones from the cache into a fresh file.
//! - **One lock per mount**: a slow commit only blocks its own mount.

pub mod backends;
mod cache;
mod engine;
mod error;
pub mod journal;
mod mount;
pub mod node;
mod ops;
pub mod path;
mod types;
mod uri;
pub mod worker;

pub use backends::BackendKind;
pub use cache::{FileCache, FileCacheItem};
pub use engine::{FsState, VirtualFileSystem};
pub use error::{VfsError, VfsResult};
pub use journal::{Action, ActionJournal, ActionKind, JournalReplay};
pub use mount::{MountInfo, MountTable};
pub use node::{EntryDescriptor, Node, NodeId, NodeKind, NodeTree};
pub use ops::{Backend, CommitContext};
pub use types::{
    AccessMode, EntryKind, MountId, MountOptions, MountPoint, OpenMode, OwnerIdentity, S_IFDIR,
    S_IFREG, UnmountCallback,
};
pub use uri::{SCHEME, VfsUri};
pub use worker::MountWorker;
