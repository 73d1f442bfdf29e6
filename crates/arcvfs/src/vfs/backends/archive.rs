//! Zip archive backend.
//!
//! The tree comes from the central directory. Entry bytes are decoded on
//! demand straight out of the archive. Commit writes a fresh archive in path
//! order: untouched entries are raw-copied (compressed bytes, CRC, sizes and
//! timestamps carried over), staged and empty entries are deflated anew.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Datelike, NaiveDate, Timelike, Utc};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::plan::{CommitPlan, PlannedEntry};
use super::BackendKind;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::node::{EntryDescriptor, Node, NodeTree, millis_to_time};
use crate::vfs::ops::{Backend, CommitContext, missing_descriptor};
use crate::vfs::path;
use crate::vfs::types::MountOptions;

/// Central-directory record of one archive entry.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Position in the central directory.
    pub index: usize,
    /// Raw entry name. Directory entries end with `/`.
    pub name: String,
    /// Uncompressed size.
    pub size: u64,
    /// Stored size.
    pub compressed_size: u64,
    /// CRC-32 of the uncompressed bytes.
    pub crc32: u32,
    /// Compression method.
    pub compression: CompressionMethod,
    /// DOS date/time field, if present.
    pub dos_datetime: Option<zip::DateTime>,
    /// `dos_datetime` as a timestamp, read as UTC.
    pub modified: Option<SystemTime>,
}

impl ArchiveEntry {
    /// Returns true for directory records.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// The DOS date/time as unix milliseconds.
    pub fn modified_millis(&self) -> Option<i64> {
        let dt = self.dos_datetime?;
        dos_to_unix_millis(dt.datepart(), dt.timepart())
    }
}

/// Convert packed DOS date and time fields to unix milliseconds (UTC).
///
/// Seconds are stored halved. Returns `None` for impossible dates.
pub fn dos_to_unix_millis(date: u16, time: u16) -> Option<i64> {
    let day = u32::from(date & 0x1F);
    let month = u32::from((date >> 5) & 0xF);
    let year = i32::from((date >> 9) & 0x7F) + 1980;
    let second = u32::from(time & 0x1F) * 2;
    let minute = u32::from((time >> 5) & 0x3F);
    let hour = u32::from((time >> 11) & 0x1F);
    let stamp = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second.min(59))?
        .and_utc();
    Some(stamp.timestamp_millis())
}

/// Current time as a DOS date/time, clamped to the zip epoch.
fn dos_now() -> zip::DateTime {
    let now = Utc::now();
    let converted = (|| {
        let year = u16::try_from(now.year()).ok()?;
        zip::DateTime::from_date_and_time(
            year,
            u8::try_from(now.month()).ok()?,
            u8::try_from(now.day()).ok()?,
            u8::try_from(now.hour()).ok()?,
            u8::try_from(now.minute()).ok()?,
            u8::try_from(now.second()).ok()?,
        )
        .ok()
    })();
    converted.unwrap_or_default()
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(dos_now())
}

/// Backend for zip archives.
pub struct ZipBackend {
    container: PathBuf,
    archive: Option<ZipArchive<File>>,
    entries: Vec<ArchiveEntry>,
}

impl ZipBackend {
    /// Create a backend for the archive at `container`. Nothing is opened
    /// until mount.
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
            archive: None,
            entries: Vec::new(),
        }
    }

    /// Central-directory records read at mount.
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Open the archive and build the tree, letting `decorate` adjust each
    /// leaf before insertion. New intermediate directories copy the leaf's
    /// extras.
    pub(crate) fn build_tree<F>(&mut self, decorate: F) -> VfsResult<NodeTree>
    where
        F: Fn(&ArchiveEntry, Node) -> Node,
    {
        let file = File::open(&self.container)?;
        let mut archive = ZipArchive::new(file)?;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let raw = archive.by_index_raw(index)?;
            let dos_datetime: Option<zip::DateTime> = raw.last_modified().into();
            let mut entry = ArchiveEntry {
                index,
                name: raw.name().to_string(),
                size: raw.size(),
                compressed_size: raw.compressed_size(),
                crc32: raw.crc32(),
                compression: raw.compression(),
                dos_datetime,
                modified: None,
            };
            entry.modified = entry.modified_millis().map(millis_to_time);
            entries.push(entry);
        }

        let mut tree = NodeTree::new();
        let mut seen: HashMap<String, String> = HashMap::with_capacity(entries.len());
        for entry in &entries {
            let full = path::sanitize(&entry.name);
            if full == path::ROOT {
                continue;
            }
            if let Some(first) = seen.insert(full.clone(), entry.name.clone()) {
                return Err(VfsError::format(format!(
                    "zip entries {first:?} and {:?} both map to {full}",
                    entry.name
                )));
            }
            let segments: Vec<&str> = path::segments(&full).collect();
            let name = path::file_name(&full);
            let leaf = if entry.is_dir() {
                Node::directory(name, true)
            } else {
                Node::file(name, Some(EntryDescriptor::Archive(entry.clone())), true)
            };
            match tree.insert_path(&segments, decorate(entry, leaf)) {
                Ok(_) => {}
                Err(VfsError::Format(msg)) => {
                    tracing::warn!(entry = %entry.name, %msg, "skipping conflicting zip entry");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(
            container = %self.container.display(),
            entries = entries.len(),
            nodes = tree.len(),
            "read zip central directory"
        );
        self.archive = Some(archive);
        self.entries = entries;
        Ok(tree)
    }

    /// Write the planned archive into a fresh output file.
    pub(crate) fn write_archive(&mut self, ctx: &CommitContext<'_>) -> VfsResult<NamedTempFile> {
        let mut plan = CommitPlan::from_originals(
            self.entries.iter().map(|e| (e.name.as_str(), e.index)),
        );
        ctx.journal.replay(&mut plan)?;

        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| VfsError::illegal_state("zip archive is not open"))?;
        let output = ctx.create_output()?;
        let mut writer = ZipWriter::new(output.as_file());
        for (full, planned) in plan.iter() {
            let rel = full.trim_start_matches('/');
            match planned {
                PlannedEntry::Original(index) => {
                    let entry = self.entries.get(*index).ok_or_else(|| {
                        VfsError::illegal_state(format!("no zip entry #{index}"))
                    })?;
                    let raw = archive.by_index_raw(*index)?;
                    // Entries still at their own path keep their raw name.
                    if path::sanitize(&entry.name) == full {
                        writer.raw_copy_file(raw)?;
                    } else {
                        let name = if entry.is_dir() {
                            format!("{rel}/")
                        } else {
                            rel.to_string()
                        };
                        writer.raw_copy_file_rename(raw, name)?;
                    }
                }
                PlannedEntry::Staged(staged) => {
                    writer.start_file(rel, file_options())?;
                    let mut src = File::open(staged)?;
                    io::copy(&mut src, &mut writer)?;
                }
                PlannedEntry::Empty => {
                    writer.start_file(rel, file_options())?;
                }
                PlannedEntry::Directory => {
                    writer.add_directory(rel, file_options())?;
                }
            }
        }
        writer.finish()?;
        output.as_file().sync_all()?;
        tracing::info!(
            container = %self.container.display(),
            entries = plan.len(),
            "wrote zip archive"
        );
        Ok(output)
    }

    fn close(&mut self) {
        self.archive = None;
        self.entries.clear();
    }
}

impl Backend for ZipBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Archive
    }

    fn container(&self) -> &Path {
        &self.container
    }

    fn on_mount(&mut self, _options: &MountOptions) -> VfsResult<NodeTree> {
        self.build_tree(|_, node| node)
    }

    fn on_unmount(&mut self, ctx: &CommitContext<'_>) -> VfsResult<Option<NamedTempFile>> {
        let result = if ctx.has_changes() {
            self.write_archive(ctx).map(Some)
        } else {
            Ok(None)
        };
        self.close();
        result
    }

    fn open_entry(&mut self, node: &Node) -> VfsResult<Box<dyn Read + '_>> {
        let Some(EntryDescriptor::Archive(entry)) = node.descriptor() else {
            return Err(missing_descriptor(node));
        };
        let archive = self
            .archive
            .as_mut()
            .ok_or_else(|| VfsError::illegal_state("zip archive is not open"))?;
        Ok(Box::new(archive.by_index(entry.index)?))
    }
}
