//! Bytecode container backend.
//!
//! Classes are addressed by fully-qualified name. The tree splits each name
//! on `.` into package directories with a `<Simple>.class` leaf, so
//! `com.example.Foo` lives at `/com/example/Foo.class`. The container is
//! small enough to hold in memory; entries are served as slices of it.
//!
//! Commit rebuilds the class table from the tree paths. Unmodified classes
//! are re-linked byte-for-byte, staged ones are re-encoded with a fresh
//! checksum, and packages left without classes disappear.

use std::borrow::Cow;
use std::fs;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::BackendKind;
use super::class_pack::{self, ClassBlob, ClassRecord};
use super::plan::{CommitPlan, PlannedEntry};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::node::{EntryDescriptor, Node, NodeTree};
use crate::vfs::ops::{Backend, CommitContext, missing_descriptor};
use crate::vfs::path;
use crate::vfs::types::{EntryKind, MountOptions};

/// Leading bytes of an Android dex file.
const DEX_MAGIC: &[u8] = b"dex\n";

/// File name suffix of class leaves.
pub const CLASS_SUFFIX: &str = ".class";

/// Class table record of one class.
#[derive(Debug, Clone)]
pub struct ClassEntry {
    /// Position in the class table.
    pub index: usize,
    /// Fully-qualified class name.
    pub class_name: String,
    /// Absolute offset of the class bytes.
    pub offset: u64,
    /// Length of the class bytes.
    pub length: u32,
    /// CRC-32 of the class bytes.
    pub crc32: u32,
}

/// Tree path of a class: `a.b.C` becomes `/a/b/C.class`.
pub fn class_path(class_name: &str) -> String {
    format!("/{}{CLASS_SUFFIX}", class_name.replace('.', "/"))
}

/// Class name of a tree path, if the path names a class leaf.
pub fn class_name_of(full: &str) -> Option<String> {
    let stem = full.strip_prefix('/')?.strip_suffix(CLASS_SUFFIX)?;
    if stem.is_empty() || stem.ends_with('/') {
        return None;
    }
    Some(stem.replace('/', "."))
}

/// Backend for class pack containers.
pub struct DexBackend {
    container: PathBuf,
    bytes: Vec<u8>,
    classes: Vec<ClassRecord>,
}

impl DexBackend {
    /// Create a backend for the container at `container`.
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
            bytes: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Class names in table order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.name.as_str())
    }

    fn original_bytes(&self, index: usize) -> VfsResult<(&[u8], u32)> {
        let record = self
            .classes
            .get(index)
            .ok_or_else(|| VfsError::illegal_state(format!("no class #{index}")))?;
        Ok((&self.bytes[record.range()?], record.crc32))
    }

    fn write_pack(&self, ctx: &CommitContext<'_>) -> VfsResult<NamedTempFile> {
        let mut plan = CommitPlan::from_originals(
            self.classes
                .iter()
                .enumerate()
                .map(|(index, c)| (class_path(&c.name), index)),
        );
        ctx.journal.replay(&mut plan)?;

        let mut blobs = Vec::new();
        for (full, planned) in plan.iter() {
            if matches!(planned, PlannedEntry::Directory) {
                continue;
            }
            let Some(name) = class_name_of(full) else {
                tracing::warn!(path = %full, "dropping non-class entry");
                continue;
            };
            let blob = match planned {
                PlannedEntry::Original(index) => {
                    let (data, crc) = self.original_bytes(*index)?;
                    ClassBlob {
                        name,
                        data: Cow::Borrowed(data),
                        crc32: Some(crc),
                    }
                }
                PlannedEntry::Staged(staged) => ClassBlob {
                    name,
                    data: Cow::Owned(fs::read(staged)?),
                    crc32: None,
                },
                PlannedEntry::Empty | PlannedEntry::Directory => ClassBlob {
                    name,
                    data: Cow::Owned(Vec::new()),
                    crc32: None,
                },
            };
            blobs.push(blob);
        }

        let count = blobs.len();
        let mut output = ctx.create_output()?;
        {
            let mut out = BufWriter::new(output.as_file_mut());
            class_pack::write_pack(&mut out, blobs)?;
        }
        output.as_file().sync_all()?;
        tracing::info!(
            container = %self.container.display(),
            classes = count,
            "wrote class pack"
        );
        Ok(output)
    }
}

impl Backend for DexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Bytecode
    }

    fn container(&self) -> &Path {
        &self.container
    }

    fn on_mount(&mut self, _options: &MountOptions) -> VfsResult<NodeTree> {
        let bytes = fs::read(&self.container)?;
        if bytes.starts_with(DEX_MAGIC) {
            return Err(VfsError::format("dex files are not supported, only class packs"));
        }
        let classes = class_pack::read_table(&bytes)?;

        let mut tree = NodeTree::new();
        for (index, record) in classes.iter().enumerate() {
            let mut segments: Vec<&str> = record.name.split('.').collect();
            if segments.iter().any(|s| s.is_empty() || s.contains('/')) {
                return Err(VfsError::format(format!(
                    "invalid class name: {}",
                    record.name
                )));
            }
            let leaf_name = format!("{}{CLASS_SUFFIX}", segments.pop().unwrap_or_default());
            segments.push(&leaf_name);
            let descriptor = EntryDescriptor::Class(ClassEntry {
                index,
                class_name: record.name.clone(),
                offset: record.offset,
                length: record.length,
                crc32: record.crc32,
            });
            tree.insert_path(&segments, Node::file(leaf_name.as_str(), Some(descriptor), true))?;
        }

        tracing::debug!(
            container = %self.container.display(),
            classes = classes.len(),
            "read class table"
        );
        self.bytes = bytes;
        self.classes = classes;
        Ok(tree)
    }

    fn on_unmount(&mut self, ctx: &CommitContext<'_>) -> VfsResult<Option<NamedTempFile>> {
        let result = if ctx.has_changes() {
            self.write_pack(ctx).map(Some)
        } else {
            Ok(None)
        };
        self.bytes = Vec::new();
        self.classes.clear();
        result
    }

    // Package segments cannot hold dots, and only `<Simple>.class` leaves
    // map back to a class name.
    fn validate_new_entry(&self, full: &str, kind: EntryKind) -> VfsResult<()> {
        let name = path::file_name(full);
        let packages = path::segments(path::parent(full));
        if let Some(bad) = packages.into_iter().find(|s| s.contains('.')) {
            return Err(VfsError::invalid_path(format!(
                "package name {bad} contains a dot"
            )));
        }
        let ok = match kind {
            EntryKind::Directory => !name.contains('.'),
            EntryKind::File => name
                .strip_suffix(CLASS_SUFFIX)
                .is_some_and(|stem| !stem.is_empty() && !stem.contains('.')),
        };
        if ok {
            Ok(())
        } else {
            Err(VfsError::invalid_path(format!(
                "{full} cannot be stored in a class container"
            )))
        }
    }

    fn open_entry(&mut self, node: &Node) -> VfsResult<Box<dyn Read + '_>> {
        let Some(EntryDescriptor::Class(entry)) = node.descriptor() else {
            return Err(missing_descriptor(node));
        };
        let (data, crc) = self.original_bytes(entry.index)?;
        if crc32fast::hash(data) != crc {
            return Err(VfsError::format(format!(
                "checksum mismatch for class {}",
                entry.class_name
            )));
        }
        Ok(Box::new(io::Cursor::new(data)))
    }
}
