//! `vfs://<mountId>/<path>` addresses.

use std::fmt;
use std::str::FromStr;

use super::error::{VfsError, VfsResult};
use super::path;
use super::types::MountId;

/// URI scheme of mount-relative addresses.
pub const SCHEME: &str = "vfs";

/// A path inside a specific mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VfsUri {
    id: MountId,
    path: String,
}

impl VfsUri {
    /// Address `path` inside mount `id`. The path is sanitized.
    pub fn new(id: MountId, path: &str) -> Self {
        Self {
            id,
            path: path::sanitize(path),
        }
    }

    /// Root address of a mount.
    pub fn root(id: MountId) -> Self {
        Self {
            id,
            path: path::ROOT.to_string(),
        }
    }

    /// Parse `vfs://<id>/<path>`.
    pub fn parse(uri: &str) -> VfsResult<Self> {
        let rest = uri
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| VfsError::invalid_argument(format!("not a vfs uri: {uri}")))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, path::ROOT),
        };
        let id = authority
            .parse::<u32>()
            .ok()
            .and_then(MountId::new)
            .ok_or_else(|| VfsError::invalid_argument(format!("bad mount id in {uri}")))?;
        Ok(Self::new(id, path))
    }

    /// The mount.
    pub fn id(&self) -> MountId {
        self.id
    }

    /// Canonical path inside the mount.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of a child entry.
    pub fn join(&self, name: &str) -> Self {
        Self::new(self.id, &format!("{}/{name}", self.path))
    }
}

impl FromStr for VfsUri {
    type Err = VfsError;

    fn from_str(s: &str) -> VfsResult<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VfsUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}{}", self.id, self.path)
    }
}
