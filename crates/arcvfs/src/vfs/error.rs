//! VFS error types.

use std::io;
use thiserror::Error;
use zip::result::ZipError;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Mount point is already in use and no remount was requested.
    #[error("mount point {0} is already in use")]
    AlreadyMounted(String),

    /// Path operation attempted on an instance that is not mounted.
    #[error("file system is not mounted")]
    NotMounted,

    /// File or directory not found, or a leaf carries no container descriptor.
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested access mode is not satisfiable.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The container's native structure could not be parsed or produced.
    #[error("malformed container: {0}")]
    Format(String),

    /// An internal invariant was violated. This is a defect, not a runtime condition.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Invalid path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Invalid argument (bad open mode, malformed locator).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create an AlreadyMounted error.
    pub fn already_mounted(mount_point: impl Into<String>) -> Self {
        Self::AlreadyMounted(mount_point.into())
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AccessDenied error.
    pub fn access_denied(path: impl Into<String>) -> Self {
        Self::AccessDenied(path.into())
    }

    /// Create a Format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create an IllegalState error. Logged at error level when built, so
    /// call sites must construct it lazily.
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "illegal vfs state");
        Self::IllegalState(msg)
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Zip I/O failures stay I/O failures; everything else is a structural problem.
impl From<ZipError> for VfsError {
    fn from(e: ZipError) -> Self {
        match e {
            ZipError::Io(e) => VfsError::Io(e),
            ZipError::FileNotFound => VfsError::NotFound("zip entry".into()),
            other => VfsError::Format(other.to_string()),
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::AlreadyMounted(msg) => io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("mount point {msg} is already in use"),
            ),
            VfsError::NotMounted => io::Error::other("file system is not mounted"),
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AccessDenied(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            VfsError::Format(msg) => io::Error::new(io::ErrorKind::InvalidData, msg),
            VfsError::IllegalState(msg) => io::Error::other(msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::Io(e) => e,
            VfsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
