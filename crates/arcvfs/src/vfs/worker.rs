//! Async facade over the blocking engine.
//!
//! Mounting, committing and every path operation do synchronous file I/O.
//! [`MountWorker`] moves that work onto tokio's blocking pool so async
//! callers never stall a runtime thread.

use std::path::PathBuf;
use std::sync::Arc;

use super::backends::BackendKind;
use super::engine::VirtualFileSystem;
use super::error::{VfsError, VfsResult};
use super::mount::MountTable;
use super::types::{MountId, MountOptions, MountPoint};

/// Runs mount table and engine calls on the blocking pool.
#[derive(Debug, Clone)]
pub struct MountWorker {
    table: Arc<MountTable>,
}

impl MountWorker {
    /// Wrap a mount table.
    pub fn new(table: Arc<MountTable>) -> Self {
        Self { table }
    }

    /// The wrapped table.
    pub fn table(&self) -> &Arc<MountTable> {
        &self.table
    }

    /// [`MountTable::mount`] off the runtime.
    #[tracing::instrument(skip_all, fields(mount_point = %mount_point))]
    pub async fn mount(
        &self,
        mount_point: MountPoint,
        container: PathBuf,
        kind: BackendKind,
        options: MountOptions,
    ) -> VfsResult<MountId> {
        let table = Arc::clone(&self.table);
        blocking(move || table.mount(mount_point, container, kind, options)).await
    }

    /// [`MountTable::unmount`] off the runtime. The commit runs here.
    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn unmount(&self, id: MountId) -> VfsResult<()> {
        let table = Arc::clone(&self.table);
        blocking(move || table.unmount(id)).await
    }

    /// Run `f` against mount `id` off the runtime.
    pub async fn with_fs<T, F>(&self, id: MountId, f: F) -> VfsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&VirtualFileSystem) -> VfsResult<T> + Send + 'static,
    {
        let fs = self.table.get_file_system(id).ok_or(VfsError::NotMounted)?;
        run_blocking(fs, f).await
    }
}

/// Run `f` against `fs` on the blocking pool.
pub async fn run_blocking<T, F>(fs: Arc<VirtualFileSystem>, f: F) -> VfsResult<T>
where
    T: Send + 'static,
    F: FnOnce(&VirtualFileSystem) -> VfsResult<T> + Send + 'static,
{
    blocking(move || f(&fs)).await
}

async fn blocking<T, F>(f: F) -> VfsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> VfsResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VfsError::other(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn fixture(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("w.zip");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("hello.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"hello").unwrap();
        zip.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn test_mount_read_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MountWorker::new(Arc::new(MountTable::new()));
        let id = worker
            .mount(
                MountPoint::new("/w"),
                fixture(dir.path()),
                BackendKind::Archive,
                MountOptions::default(),
            )
            .await
            .unwrap();

        let body = worker
            .with_fs(id, |fs| {
                let mut body = String::new();
                fs.new_input_stream("/hello.txt")?.read_to_string(&mut body)?;
                Ok(body)
            })
            .await
            .unwrap();
        assert_eq!(body, "hello");

        worker.unmount(id).await.unwrap();
        assert!(matches!(
            worker.with_fs(id, |fs| fs.exists("/")).await,
            Err(VfsError::NotMounted)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_mounts_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let container = fixture(dir.path());
        let worker = MountWorker::new(Arc::new(MountTable::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let worker = worker.clone();
            let container = container.clone();
            handles.push(tokio::spawn(async move {
                worker
                    .mount(
                        MountPoint::new(format!("/c/{i}")),
                        container,
                        BackendKind::Archive,
                        MountOptions::default(),
                    )
                    .await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(worker.table().list_file_systems_under("/c").len(), 8);
    }
}
