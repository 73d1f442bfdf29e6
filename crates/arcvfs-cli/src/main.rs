//! arcvfs command line.
//!
//! Mounts one container, runs one command against it and unmounts. Commands
//! that change the tree mount read-write, so the container is rebuilt on
//! exit. The rebuilt container replaces the original only if the command
//! succeeded.
//!
//! Usage:
//!   arcvfs app.zip ls /res
//!   arcvfs app.zip put /assets/logo.png --from logo.png
//!   arcvfs --kind dex classes.bin tree
//!   RUST_LOG=arcvfs=debug arcvfs app.zip mv /a /b

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, fmt};

use arcvfs::vfs::path;
use arcvfs::{
    BackendKind, MountId, MountOptions, MountPoint, MountTable, MountWorker, VfsConfig, VfsError,
    VfsResult, VirtualFileSystem,
};

/// Browse and edit container files as directory trees.
#[derive(Parser, Debug)]
#[command(name = "arcvfs")]
#[command(about = "Browse and edit zip, class pack and apk containers")]
struct Args {
    /// Container format (zip, dex, apk). Guessed from the extension if omitted.
    #[arg(long, value_parser = parse_kind)]
    kind: Option<BackendKind>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// The container file
    container: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print the tree below a directory
    Tree {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file's content to stdout
    Cat { path: String },
    /// Store a file, creating it and its parents as needed
    Put {
        path: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Delete a file or directory
    Rm { path: String },
    /// Move a file or directory
    Mv { src: String, dst: String },
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parents too
        #[arg(short, long)]
        parents: bool,
    },
    /// Show metadata
    Stat { path: String },
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(
            self,
            Command::Put { .. } | Command::Rm { .. } | Command::Mv { .. } | Command::Mkdir { .. }
        )
    }
}

fn parse_kind(s: &str) -> Result<BackendKind, String> {
    BackendKind::from_str(s).ok_or_else(|| format!("unknown container kind: {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => VfsConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => VfsConfig::default(),
    };
    let kind = match args.kind {
        Some(kind) => kind,
        None => BackendKind::from_extension(&args.container).with_context(|| {
            format!(
                "cannot tell the format of {}; pass --kind",
                args.container.display()
            )
        })?,
    };
    let pending = PendingContainer::default();
    let options = if args.command.mutates() {
        pending.capture(MountOptions::read_write())
    } else {
        MountOptions::read_only()
    };

    // Upload content is read before the container is mounted.
    let upload = match &args.command {
        Command::Put { from: Some(src), .. } => {
            Some(std::fs::read(src).with_context(|| format!("failed to read {}", src.display()))?)
        }
        Command::Put { from: None, .. } => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Some(buf)
        }
        _ => None,
    };

    let worker = MountWorker::new(Arc::new(MountTable::with_config(config)));
    let id = worker
        .mount(
            MountPoint::from(args.container.as_path()),
            args.container.clone(),
            kind,
            options,
        )
        .await
        .with_context(|| format!("failed to mount {}", args.container.display()))?;
    tracing::debug!(%id, %kind, "mounted container");

    let outcome = run(&worker, id, args.command, upload).await;
    let committed = worker.unmount(id).await;
    if outcome.is_err() {
        tracing::warn!("command failed, discarding changes");
    }
    let published = pending.finish(&args.container, outcome.is_ok() && committed.is_ok());
    outcome?;
    committed.with_context(|| format!("failed to write {}", args.container.display()))?;
    published.with_context(|| format!("failed to replace {}", args.container.display()))?;
    Ok(())
}

/// Holds a rebuilt container until the command's outcome is known.
#[derive(Clone, Default)]
struct PendingContainer(Arc<Mutex<Option<PathBuf>>>);

impl PendingContainer {
    /// Route the unmount output here instead of over the container.
    fn capture(&self, options: MountOptions) -> MountOptions {
        let slot = self.clone();
        options.with_unmount_callback(move |_, built| *slot.0.lock() = Some(built))
    }

    /// Move the rebuilt container into place when `publish` is set, otherwise
    /// delete it. Returns whether the container was replaced.
    fn finish(&self, container: &Path, publish: bool) -> std::io::Result<bool> {
        let Some(built) = self.0.lock().take() else {
            return Ok(false);
        };
        if publish {
            std::fs::rename(&built, container)?;
            Ok(true)
        } else {
            std::fs::remove_file(&built)?;
            Ok(false)
        }
    }
}

async fn run(
    worker: &MountWorker,
    id: MountId,
    command: Command,
    upload: Option<Vec<u8>>,
) -> Result<()> {
    match command {
        Command::Ls { path } => {
            let rows = worker.with_fs(id, move |fs| list_rows(fs, &path)).await?;
            for (name, is_dir, len) in rows {
                let marker = if is_dir { "/" } else { "" };
                println!("{len:>10}  {name}{marker}");
            }
        }
        Command::Tree { path } => {
            let lines = worker
                .with_fs(id, move |fs| {
                    let mut lines = vec![path.clone()];
                    tree_lines(fs, &path, 1, &mut lines)?;
                    Ok(lines)
                })
                .await?;
            for line in lines {
                println!("{line}");
            }
        }
        Command::Cat { path } => {
            let body = worker
                .with_fs(id, move |fs| {
                    let mut body = Vec::new();
                    fs.new_input_stream(&path)?.read_to_end(&mut body)?;
                    Ok(body)
                })
                .await?;
            std::io::stdout().write_all(&body)?;
        }
        Command::Put { path, .. } => {
            let path = path::sanitize(&path);
            let body = upload.unwrap_or_default();
            let len = body.len();
            worker
                .with_fs(id, move |fs| {
                    if !fs.exists(&path)? {
                        fs.mkdirs(path::parent(&path))?;
                        fs.create_new_file(&path)?;
                    }
                    fs.new_output_stream(&path, false)?.write_all(&body)?;
                    Ok(())
                })
                .await?;
            tracing::info!(bytes = len, "stored file");
        }
        Command::Rm { path } => {
            let target = path.clone();
            let removed = worker.with_fs(id, move |fs| fs.delete(&target)).await?;
            if !removed {
                bail!("{path}: no such file or directory");
            }
        }
        Command::Mv { src, dst } => {
            worker.with_fs(id, move |fs| fs.rename_to(&src, &dst)).await?;
        }
        Command::Mkdir { path, parents } => {
            worker
                .with_fs(id, move |fs| {
                    if parents {
                        fs.mkdirs(&path)
                    } else {
                        fs.mkdir(&path)
                    }
                })
                .await?;
        }
        Command::Stat { path } => {
            let report = worker.with_fs(id, move |fs| stat_report(fs, &path)).await?;
            print!("{report}");
        }
    }
    Ok(())
}

fn list_rows(fs: &VirtualFileSystem, dir: &str) -> VfsResult<Vec<(String, bool, u64)>> {
    let names = fs
        .list(dir)?
        .ok_or_else(|| VfsError::not_a_directory(dir.to_string()))?;
    names
        .into_iter()
        .map(|name| {
            let child = path::join(dir, &name);
            Ok((name, fs.is_directory(&child)?, fs.length(&child)?))
        })
        .collect()
}

fn tree_lines(
    fs: &VirtualFileSystem,
    dir: &str,
    depth: usize,
    lines: &mut Vec<String>,
) -> VfsResult<()> {
    let Some(names) = fs.list(dir)? else {
        return Ok(());
    };
    for name in names {
        let child = path::join(dir, &name);
        let is_dir = fs.is_directory(&child)?;
        let marker = if is_dir { "/" } else { "" };
        lines.push(format!("{}{name}{marker}", "  ".repeat(depth)));
        if is_dir {
            tree_lines(fs, &child, depth + 1, lines)?;
        }
    }
    Ok(())
}

fn stat_report(fs: &VirtualFileSystem, path: &str) -> VfsResult<String> {
    let kind = if fs.is_directory(path)? {
        "directory"
    } else if fs.is_file(path)? {
        "file"
    } else {
        return Err(VfsError::not_found(path.to_string()));
    };
    let modified: DateTime<Utc> = fs.last_modified(path)?.into();
    let mut report = format!(
        "path: {path}\nkind: {kind}\nsize: {}\nmode: {:o}\nmodified: {}\n",
        fs.length(path)?,
        fs.get_mode(path)?,
        modified.to_rfc3339(),
    );
    if let Some(owner) = fs.get_owner_identity(path)? {
        report.push_str(&format!("owner: {}:{}\n", owner.uid, owner.gid));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    // End of central directory record with no entries.
    const EMPTY_ZIP: [u8; 22] = [
        0x50, 0x4B, 0x05, 0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    ];

    fn mkdirs_and_unmount(container: &Path, pending: &PendingContainer) {
        let table = MountTable::new();
        let options = pending.capture(MountOptions::read_write());
        let id = table
            .mount("/c", container, BackendKind::Archive, options)
            .unwrap();
        table.get_file_system(id).unwrap().mkdirs("/a/b").unwrap();
        table.unmount(id).unwrap();
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_failed_command_leaves_container_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("c.zip");
        std::fs::write(&container, EMPTY_ZIP).unwrap();

        let pending = PendingContainer::default();
        mkdirs_and_unmount(&container, &pending);
        assert!(!pending.finish(&container, false).unwrap());

        assert_eq!(std::fs::read(&container).unwrap(), EMPTY_ZIP);
        assert_eq!(file_names(dir.path()), vec!["c.zip".to_string()]);
    }

    #[test]
    fn test_successful_command_replaces_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("c.zip");
        std::fs::write(&container, EMPTY_ZIP).unwrap();

        let pending = PendingContainer::default();
        mkdirs_and_unmount(&container, &pending);
        assert!(pending.finish(&container, true).unwrap());
        assert_eq!(file_names(dir.path()), vec!["c.zip".to_string()]);

        let table = MountTable::new();
        let id = table
            .mount("/c", &container, BackendKind::Archive, MountOptions::read_only())
            .unwrap();
        assert!(table.get_file_system(id).unwrap().is_directory("/a/b").unwrap());
    }

    #[test]
    fn test_finish_without_output_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("c.zip");
        std::fs::write(&container, EMPTY_ZIP).unwrap();
        assert!(!PendingContainer::default().finish(&container, true).unwrap());
        assert_eq!(std::fs::read(&container).unwrap(), EMPTY_ZIP);
    }
}
