//! Fixtures and instrumented backends shared by the integration tests.

#![allow(dead_code)]

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arcvfs::vfs::backends::ZipBackend;
use arcvfs::vfs::backends::class_pack::{self, ClassBlob};
use arcvfs::vfs::{Backend, BackendKind, CommitContext, Node, NodeTree};
use arcvfs::{MountOptions, VfsError, VfsResult};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

/// 2020-05-17 08:30:10 UTC in milliseconds.
pub const FIXTURE_MILLIS: i64 = 1_589_704_210_000;

fn options(method: CompressionMethod) -> SimpleFileOptions {
    let time = DateTime::from_date_and_time(2020, 5, 17, 8, 30, 10).unwrap();
    SimpleFileOptions::default()
        .compression_method(method)
        .last_modified_time(time)
}

/// Zip with a stored file, two deflated files and an explicit directory:
///
/// ```text
/// /docs/readme.txt      stored
/// /src/main.rs
/// /src/util/strings.rs
/// /empty/
/// ```
pub fn zip_fixture(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut zip = ZipWriter::new(File::create(&path).unwrap());
    let deflated = || options(CompressionMethod::Deflated);

    zip.start_file("docs/readme.txt", options(CompressionMethod::Stored))
        .unwrap();
    zip.write_all(b"read me first").unwrap();
    zip.start_file("src/main.rs", deflated()).unwrap();
    zip.write_all(b"fn main() {}\n").unwrap();
    zip.start_file("src/util/strings.rs", deflated()).unwrap();
    zip.write_all(b"pub fn shout(s: &str) -> String { s.to_uppercase() }\n")
        .unwrap();
    zip.add_directory("empty/", deflated()).unwrap();
    zip.finish().unwrap();
    path
}

/// Class pack with three classes in two packages.
pub fn dex_fixture(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let classes = [
        ("com.example.Main", &b"main-bytes"[..]),
        ("com.example.util.Strings", &b"strings-bytes"[..]),
        ("org.other.Thing", &b"thing"[..]),
    ];
    let blobs = classes
        .iter()
        .map(|(name, data)| ClassBlob {
            name: name.to_string(),
            data: Cow::Borrowed(*data),
            crc32: None,
        })
        .collect();
    let mut file = File::create(&path).unwrap();
    class_pack::write_pack(&mut file, blobs).unwrap();
    path
}

/// Entry names and contents of a zip, in archive order.
pub fn zip_contents(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut out = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        out.push((entry.name().to_string(), body));
    }
    out
}

/// Names of everything in `dir`.
pub fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn read_to_string(fs: &arcvfs::VirtualFileSystem, path: &str) -> String {
    let mut body = String::new();
    fs.new_input_stream(path)
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    body
}

pub fn write_all(fs: &arcvfs::VirtualFileSystem, path: &str, body: &[u8]) {
    fs.new_output_stream(path, false)
        .unwrap()
        .write_all(body)
        .unwrap();
}

/// Zip backend that counts how often entry bytes are decoded.
pub struct CountingBackend {
    inner: ZipBackend,
    opens: Arc<AtomicUsize>,
}

impl CountingBackend {
    pub fn new(container: impl Into<PathBuf>) -> (Self, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let backend = Self {
            inner: ZipBackend::new(container),
            opens: Arc::clone(&opens),
        };
        (backend, opens)
    }
}

impl Backend for CountingBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn container(&self) -> &Path {
        self.inner.container()
    }

    fn on_mount(&mut self, options: &MountOptions) -> VfsResult<NodeTree> {
        self.inner.on_mount(options)
    }

    fn on_unmount(&mut self, ctx: &CommitContext<'_>) -> VfsResult<Option<NamedTempFile>> {
        self.inner.on_unmount(ctx)
    }

    fn open_entry(&mut self, node: &Node) -> VfsResult<Box<dyn Read + '_>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open_entry(node)
    }
}

/// Zip backend whose commit builds the new archive and then fails.
pub struct FailingCommitBackend {
    inner: ZipBackend,
}

impl FailingCommitBackend {
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self {
            inner: ZipBackend::new(container),
        }
    }
}

impl Backend for FailingCommitBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn container(&self) -> &Path {
        self.inner.container()
    }

    fn on_mount(&mut self, options: &MountOptions) -> VfsResult<NodeTree> {
        self.inner.on_mount(options)
    }

    fn on_unmount(&mut self, ctx: &CommitContext<'_>) -> VfsResult<Option<NamedTempFile>> {
        let partial = self.inner.on_unmount(ctx)?;
        assert!(partial.is_some(), "expected a commit to abort");
        Err(VfsError::format("injected commit failure"))
    }

    fn open_entry(&mut self, node: &Node) -> VfsResult<Box<dyn Read + '_>> {
        self.inner.open_entry(node)
    }
}
