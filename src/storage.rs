//! Blob storage for downloaded content
//!
//! Content is written through a [`BlobSink`] that stages bytes in a temporary
//! file and only makes them visible under the task's key on
//! [`commit`](BlobSink::commit). An aborted or dropped sink leaves any
//! previously committed blob untouched. Staging files left behind by a crashed
//! or abandoned transfer are removed by [`LocalBlobStore::sweep_staging`].

use crate::error::StorageError;
use crate::types::TaskId;
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const STAGING_PREFIX: &str = ".staging";

/// Key under which a task's content is stored
pub fn blob_key(task_id: TaskId) -> String {
    task_id.to_string()
}

/// Writable handle for one blob
///
/// Bytes written are not visible to readers until [`commit`](Self::commit).
#[async_trait]
pub trait BlobSink: AsyncWrite + Unpin + Send {
    /// Flush and atomically publish the written bytes under the sink's key
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Readable handle for one committed blob
pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

/// Content storage keyed by string
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a staging sink for `key`
    async fn open_for_write(&self, key: &str) -> Result<Box<dyn BlobSink>>;

    /// Open a committed blob for reading, with its size in bytes
    async fn open_for_read(&self, key: &str) -> Result<(BlobReader, u64)>;

    /// Remove a committed blob; missing blobs are not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Blob store backed by a local directory
pub struct LocalBlobStore {
    root: PathBuf,
    staging_seq: AtomicU64,
}

impl LocalBlobStore {
    /// Use `root` as the blob directory, creating it if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_failure(&root.display().to_string(), e))?;
        Ok(Self {
            root,
            staging_seq: AtomicU64::new(0),
        })
    }

    /// Directory blobs are stored in
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Delete staging files left behind by sinks that were never committed or
    /// aborted, returning how many were removed
    ///
    /// Only call this while no sink of this store is open.
    pub async fn sweep_staging(&self) -> Result<usize> {
        let root = self.root.display().to_string();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| storage_failure(&root, e))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_failure(&root, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(STAGING_PREFIX) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(storage_failure(&name, e)),
            }
        }

        if removed > 0 {
            tracing::info!(root = %root, removed, "Removed abandoned staging files");
        }
        Ok(removed)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key == "."
            || key == ".."
            || key.contains(['/', '\\'])
            || key.starts_with(STAGING_PREFIX)
        {
            return Err(Error::Storage(StorageError::InvalidKey(key.to_string())));
        }
        Ok(self.root.join(key))
    }

    fn staging_path_for(&self, key: &str) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}-{}-{}-{}",
            STAGING_PREFIX,
            key,
            std::process::id(),
            seq
        ))
    }
}

fn storage_failure(key: &str, e: std::io::Error) -> Error {
    Error::Storage(StorageError::Failed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn open_for_write(&self, key: &str) -> Result<Box<dyn BlobSink>> {
        let target = self.path_for(key)?;
        let staging = self.staging_path_for(key);
        let file = File::create(&staging)
            .await
            .map_err(|e| storage_failure(key, e))?;

        Ok(Box::new(LocalBlobSink {
            key: key.to_string(),
            file,
            staging,
            target,
            written: 0,
        }))
    }

    async fn open_for_read(&self, key: &str) -> Result<(BlobReader, u64)> {
        let path = self.path_for(key)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Storage(StorageError::NotFound(key.to_string())));
            }
            Err(e) => return Err(storage_failure(key, e)),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| storage_failure(key, e))?
            .len();
        Ok((Box::new(file), size))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_failure(key, e)),
        }
    }
}

struct LocalBlobSink {
    key: String,
    file: File,
    staging: PathBuf,
    target: PathBuf,
    written: u64,
}

impl AsyncWrite for LocalBlobSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.file).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.written += *n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl BlobSink for LocalBlobSink {
    async fn commit(self: Box<Self>) -> Result<u64> {
        let LocalBlobSink {
            key,
            file,
            staging,
            target,
            written,
        } = *self;

        let mut file = file;
        if let Err(e) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(storage_failure(&key, e));
        }

        let std_file = file.into_std().await;
        let synced = tokio::task::spawn_blocking(move || std_file.sync_all())
            .await
            .map_err(|e| Error::Other(format!("sync task failed: {}", e)))?;
        if let Err(e) = synced {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(storage_failure(&key, e));
        }

        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(storage_failure(&key, e));
        }

        tracing::debug!(key = %key, bytes = written, "Blob committed");
        Ok(written)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let LocalBlobSink {
            key, file, staging, ..
        } = *self;
        drop(file);

        match tokio::fs::remove_file(&staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_failure(&key, e)),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn store() -> (LocalBlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs")).await.unwrap();
        (store, dir)
    }

    async fn read_all(store: &LocalBlobStore, key: &str) -> Vec<u8> {
        let (mut reader, _) = store.open_for_read(key).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn visible_entries(store: &LocalBlobStore) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn commit_makes_content_visible() {
        let (store, _dir) = store().await;

        let mut sink = store.open_for_write("7").await.unwrap();
        sink.write_all(b"hello ").await.unwrap();
        sink.write_all(b"world").await.unwrap();

        assert!(
            matches!(
                store.open_for_read("7").await,
                Err(Error::Storage(StorageError::NotFound(_)))
            ),
            "staged bytes are not readable before commit"
        );

        assert_eq!(sink.commit().await.unwrap(), 11);
        assert_eq!(read_all(&store, "7").await, b"hello world");
        assert_eq!(store.open_for_read("7").await.unwrap().1, 11);
        assert_eq!(visible_entries(&store), vec!["7"]);
    }

    #[tokio::test]
    async fn abort_keeps_previous_blob() {
        let (store, _dir) = store().await;

        let mut first = store.open_for_write("1").await.unwrap();
        first.write_all(b"v1").await.unwrap();
        first.commit().await.unwrap();

        let mut second = store.open_for_write("1").await.unwrap();
        second.write_all(b"partial v2").await.unwrap();
        second.abort().await.unwrap();

        assert_eq!(read_all(&store, "1").await, b"v1");
        assert_eq!(visible_entries(&store), vec!["1"]);
    }

    #[tokio::test]
    async fn commit_replaces_previous_blob() {
        let (store, _dir) = store().await;

        for body in [&b"old"[..], &b"newer"[..]] {
            let mut sink = store.open_for_write("3").await.unwrap();
            sink.write_all(body).await.unwrap();
            sink.commit().await.unwrap();
        }

        assert_eq!(read_all(&store, "3").await, b"newer");
    }

    #[tokio::test]
    async fn concurrent_sinks_for_same_key_do_not_collide() {
        let (store, _dir) = store().await;

        let mut a = store.open_for_write("5").await.unwrap();
        let mut b = store.open_for_write("5").await.unwrap();
        a.write_all(b"aaaa").await.unwrap();
        b.write_all(b"bb").await.unwrap();
        a.abort().await.unwrap();
        b.commit().await.unwrap();

        assert_eq!(read_all(&store, "5").await, b"bb");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (store, _dir) = store().await;

        let mut sink = store.open_for_write("9").await.unwrap();
        sink.write_all(b"x").await.unwrap();
        sink.commit().await.unwrap();

        store.remove("9").await.unwrap();
        store.remove("9").await.unwrap();
        assert!(matches!(
            store.open_for_read("9").await,
            Err(Error::Storage(StorageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let (store, _dir) = store().await;

        for key in ["", "..", "../etc", "a/b", "a\\b", ".staging-x"] {
            assert!(
                matches!(
                    store.open_for_write(key).await,
                    Err(Error::Storage(StorageError::InvalidKey(_)))
                ),
                "key {:?} should be rejected",
                key
            );
        }
    }

    #[tokio::test]
    async fn sweep_removes_abandoned_staging_files() {
        let (store, dir) = store().await;

        let mut kept = store.open_for_write("1").await.unwrap();
        kept.write_all(b"done").await.unwrap();
        kept.commit().await.unwrap();

        // A transfer that never finished: the sink is dropped without commit or abort
        let mut abandoned = store.open_for_write("7").await.unwrap();
        abandoned.write_all(b"partial").await.unwrap();
        abandoned.flush().await.unwrap();
        drop(abandoned);
        assert_eq!(visible_entries(&store).len(), 2);

        let reopened = LocalBlobStore::new(dir.path().join("blobs")).await.unwrap();
        assert_eq!(reopened.sweep_staging().await.unwrap(), 1);
        assert_eq!(visible_entries(&reopened), vec!["1"]);
        assert_eq!(read_all(&reopened, "1").await, b"done");

        assert_eq!(reopened.sweep_staging().await.unwrap(), 0);
    }

    #[test]
    fn blob_key_is_task_id() {
        assert_eq!(blob_key(TaskId(42)), "42");
    }
}
