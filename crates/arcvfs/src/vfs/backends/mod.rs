//! Container backends.
//!
//! Each backend implements [`Backend`](super::Backend) for one container
//! format. [`BackendKind`] is the closed set of formats the engine knows how
//! to construct.

pub mod apk;
pub mod archive;
pub mod class_pack;
pub mod dex;
mod plan;

use std::path::{Path, PathBuf};
use std::str::FromStr;

use strum::EnumString;

pub use apk::ApkBackend;
pub use archive::{ArchiveEntry, ZipBackend};
pub use dex::{ClassEntry, DexBackend};
pub use plan::{CommitPlan, PlannedEntry};

use super::ops::Backend;

/// Container format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BackendKind {
    /// Zip archive.
    #[strum(serialize = "zip", serialize = "archive", serialize = "jar")]
    Archive,
    /// Class pack bytecode container. Android dex files are not readable.
    #[strum(serialize = "dex", serialize = "bytecode")]
    Bytecode,
    /// APK package, read-only.
    #[strum(serialize = "apk", serialize = "package")]
    Package,
}

impl BackendKind {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Archive => "zip",
            BackendKind::Bytecode => "dex",
            BackendKind::Package => "apk",
        }
    }

    /// Guess the format from a container's file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "zip" | "jar" => Some(BackendKind::Archive),
            "cpk" => Some(BackendKind::Bytecode),
            "apk" | "apks" => Some(BackendKind::Package),
            _ => None,
        }
    }

    /// Construct the backend for a container. Nothing is opened until mount.
    pub fn create_backend(self, container: impl Into<PathBuf>) -> Box<dyn Backend> {
        let container = container.into();
        match self {
            BackendKind::Archive => Box::new(ZipBackend::new(container)),
            BackendKind::Bytecode => Box::new(DexBackend::new(container)),
            BackendKind::Package => Box::new(ApkBackend::new(container)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(BackendKind::from_str("ZIP"), Some(BackendKind::Archive));
        assert_eq!(BackendKind::from_str("bytecode"), Some(BackendKind::Bytecode));
        assert_eq!(BackendKind::from_str("apk"), Some(BackendKind::Package));
        assert_eq!(BackendKind::from_str("tar"), None);
    }

    #[test]
    fn test_from_extension() {
        assert_eq!(
            BackendKind::from_extension(Path::new("/x/base.APK")),
            Some(BackendKind::Package)
        );
        assert_eq!(
            BackendKind::from_extension(Path::new("classes.cpk")),
            Some(BackendKind::Bytecode)
        );
        // Real dex files are not class packs; they need an explicit --kind
        // and are then refused at mount.
        assert_eq!(BackendKind::from_extension(Path::new("classes.dex")), None);
        assert_eq!(BackendKind::from_extension(Path::new("README")), None);
    }

    #[test]
    fn test_created_backend_matches_kind() {
        for kind in [
            BackendKind::Archive,
            BackendKind::Bytecode,
            BackendKind::Package,
        ] {
            let backend = kind.create_backend("/tmp/none");
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.container(), Path::new("/tmp/none"));
        }
    }
}
