//! Core VFS types: identities, access modes, open modes and mount options.

use std::fmt;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{VfsError, VfsResult};

/// Directory type bits, as in `st_mode`.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bits, as in `st_mode`.
pub const S_IFREG: u32 = 0o100000;

/// Opaque identifier of a live mount. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(u32);

impl MountId {
    /// Wrap a raw id. Returns `None` for zero, which is never allocated.
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// The raw integer value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Abstract address at which a container becomes visible.
///
/// Any locator string works (`file:///sdcard/app.apk`, `/tmp/a.zip`). It is
/// normalized by dropping trailing slashes so `x/` and `x` name the same point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountPoint(String);

impl MountPoint {
    /// Create a normalized mount point.
    pub fn new(locator: impl Into<String>) -> Self {
        let locator: String = locator.into();
        let trimmed = locator.trim_end_matches('/');
        if trimmed.is_empty() || trimmed.ends_with(':') {
            // Keep "/" and "scheme://" roots intact.
            Self(locator)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// The locator string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The locator with its last path segment removed.
    pub fn parent(&self) -> MountPoint {
        match self.0.rfind('/') {
            Some(0) => MountPoint("/".to_string()),
            Some(idx) => MountPoint::new(&self.0[..idx]),
            None => MountPoint(String::new()),
        }
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MountPoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MountPoint {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&Path> for MountPoint {
    fn from(p: &Path) -> Self {
        Self::new(p.to_string_lossy().into_owned())
    }
}

/// Kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl EntryKind {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, EntryKind::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// Access check mode, `access(2)` style.
///
/// `EXISTS` is the empty set; the other modes combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMode(u8);

impl AccessMode {
    /// Only check that the path exists.
    pub const EXISTS: AccessMode = AccessMode(0);
    /// Execute (search for directories).
    pub const EXECUTE: AccessMode = AccessMode(1);
    /// Write.
    pub const WRITE: AccessMode = AccessMode(2);
    /// Read.
    pub const READ: AccessMode = AccessMode(4);

    /// Returns true if every bit of `other` is set in `self`.
    pub fn contains(self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if this is the bare existence check.
    pub fn is_exists(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

/// Open mode for channels and file descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Truncate on open.
    pub truncate: bool,
}

impl Default for OpenMode {
    fn default() -> Self {
        Self::read_only()
    }
}

impl OpenMode {
    /// Read-only access.
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            truncate: false,
        }
    }

    /// Write-only access.
    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            append: false,
            truncate: false,
        }
    }

    /// Read and write access.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            append: false,
            truncate: false,
        }
    }

    /// Set truncate.
    pub fn with_truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Set append.
    pub fn with_append(mut self) -> Self {
        self.append = true;
        self
    }

    /// Parse a descriptor mode string: `r`, `w`, `wt`, `wa`, `rw`, `rwt`.
    pub fn parse(mode: &str) -> VfsResult<Self> {
        let mut parsed = Self {
            read: false,
            write: false,
            append: false,
            truncate: false,
        };
        for c in mode.chars() {
            match c {
                'r' => parsed.read = true,
                'w' => parsed.write = true,
                'a' => parsed.append = true,
                't' => parsed.truncate = true,
                _ => return Err(VfsError::invalid_argument(format!("bad mode: {mode}"))),
            }
        }
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject modes that request neither reading nor writing.
    pub fn validate(&self) -> VfsResult<()> {
        if !self.read && !self.write {
            return Err(VfsError::invalid_argument(
                "mode requests neither read nor write",
            ));
        }
        if (self.append || self.truncate) && !self.write {
            return Err(VfsError::invalid_argument(
                "append/truncate require write access",
            ));
        }
        Ok(())
    }

    /// The access check this mode needs.
    pub fn access(&self) -> AccessMode {
        let mut access = AccessMode::EXISTS;
        if self.read {
            access = access | AccessMode::READ;
        }
        if self.write {
            access = access | AccessMode::WRITE;
        }
        access
    }
}

/// Owner identity reported for every path of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIdentity {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
}

impl OwnerIdentity {
    /// Create a new owner identity.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// Invoked after a successful commit instead of replacing the container.
///
/// Receives the original container path and the freshly built file, which the
/// callback now owns.
pub type UnmountCallback = Arc<dyn Fn(&Path, PathBuf) + Send + Sync>;

/// Immutable configuration captured at mount time.
#[derive(Clone)]
pub struct MountOptions {
    /// Reuse an existing mount at the same mount point instead of failing.
    pub remount: bool,
    /// Allow mutations. Read-only mounts never produce a new container.
    pub read_write: bool,
    /// Permission bits reported by `get_mode` (type bits are added on top).
    pub mode: u32,
    /// Owner identity reported for every path.
    pub owner: Option<OwnerIdentity>,
    /// Completion hook; when set the original container is left in place.
    pub on_unmount: Option<UnmountCallback>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            remount: false,
            read_write: false,
            mode: 0o644,
            owner: None,
            on_unmount: None,
        }
    }
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("remount", &self.remount)
            .field("read_write", &self.read_write)
            .field("mode", &format_args!("{:o}", self.mode))
            .field("owner", &self.owner)
            .field("on_unmount", &self.on_unmount.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl MountOptions {
    /// Read-only options.
    pub fn read_only() -> Self {
        Self::default()
    }

    /// Read-write options.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Set the remount flag.
    pub fn with_remount(mut self, remount: bool) -> Self {
        self.remount = remount;
        self
    }

    /// Set permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode & 0o7777;
        self
    }

    /// Set owner identity.
    pub fn with_owner(mut self, owner: OwnerIdentity) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the completion hook.
    pub fn with_unmount_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Path, PathBuf) + Send + Sync + 'static,
    {
        self.on_unmount = Some(Arc::new(callback));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_id_never_zero() {
        assert!(MountId::new(0).is_none());
        assert_eq!(MountId::new(7).map(MountId::get), Some(7));
    }

    #[test]
    fn test_mount_point_parent() {
        let mp = MountPoint::new("file:///sdcard/apps/app.apk/");
        assert_eq!(mp.as_str(), "file:///sdcard/apps/app.apk");
        assert_eq!(mp.parent().as_str(), "file:///sdcard/apps");

        assert_eq!(MountPoint::new("/a.zip").parent().as_str(), "/");
        assert_eq!(MountPoint::new("/").as_str(), "/");
    }

    #[test]
    fn test_access_mode() {
        let rw = AccessMode::READ | AccessMode::WRITE;
        assert!(rw.contains(AccessMode::READ));
        assert!(rw.contains(AccessMode::WRITE));
        assert!(!rw.contains(AccessMode::EXECUTE));
        assert!(AccessMode::EXISTS.is_exists());
    }

    #[test]
    fn test_open_mode_parse() {
        let m = OpenMode::parse("rwt").unwrap();
        assert!(m.read && m.write && m.truncate && !m.append);

        let m = OpenMode::parse("wa").unwrap();
        assert!(!m.read && m.write && m.append);

        assert!(OpenMode::parse("").is_err());
        assert!(OpenMode::parse("x").is_err());
        assert!(OpenMode::parse("ra").is_err());
    }

    #[test]
    fn test_open_mode_access() {
        assert_eq!(OpenMode::read_only().access(), AccessMode::READ);
        assert_eq!(
            OpenMode::read_write().access(),
            AccessMode::READ | AccessMode::WRITE
        );
    }

    #[test]
    fn test_mount_options_builder() {
        let opts = MountOptions::read_write()
            .with_mode(0o100640)
            .with_owner(OwnerIdentity::new(1000, 1000));
        assert!(opts.read_write);
        assert_eq!(opts.mode, 0o640);
        assert_eq!(opts.owner, Some(OwnerIdentity::new(1000, 1000)));
        assert!(opts.on_unmount.is_none());
    }
}
