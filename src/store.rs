//! Blob storage behind the server session.
//!
//! The session only needs byte-in/byte-out access keyed by name. The
//! directory store maps each name straight onto a file inside the storage
//! directory; names are joined as given, without canonicalisation.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::events::{Event, Sink};

/// Default storage directory, relative to the working directory.
pub const DEFAULT_DIRECTORY: &str = "server_files";

/// Name-keyed byte storage used by the server session.
pub trait BlobStore: Send + Sync + 'static {
    /// Store `data` under `name`, replacing any previous value.
    fn put(&self, name: &str, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Fetch the value under `name`; `Ok(None)` when nothing is stored.
    fn get(&self, name: &str) -> impl Future<Output = io::Result<Option<Bytes>>> + Send;
}

/// Stores each blob as one regular file in a directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open the store, creating the directory if it does not exist yet.
    pub async fn open(root: impl Into<PathBuf>, sink: &Sink) -> io::Result<Self> {
        let root = root.into();
        if !tokio::fs::try_exists(&root).await? {
            tokio::fs::create_dir_all(&root).await?;
            sink.post(Event::StoreCreated {
                directory: root.clone(),
            });
        }
        Ok(DirStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BlobStore for DirStore {
    fn put(&self, name: &str, data: Bytes) -> impl Future<Output = io::Result<()>> + Send {
        let path = self.path_for(name);
        async move {
            trace!(path = %path.display(), len = data.len(), "Writing blob");
            tokio::fs::write(&path, &data).await
        }
    }

    fn get(&self, name: &str) -> impl Future<Output = io::Result<Option<Bytes>>> + Send {
        let path = self.path_for(name);
        async move {
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        }
    }
}

/// In-memory store with switchable failures, for session tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    blobs: std::sync::Mutex<std::collections::HashMap<String, Bytes>>,
    pub(crate) fail_writes: std::sync::atomic::AtomicBool,
    pub(crate) fail_reads: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryStore {
    pub(crate) fn value(&self, name: &str) -> Option<Bytes> {
        self.blobs.lock().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
impl BlobStore for MemoryStore {
    fn put(&self, name: &str, data: Bytes) -> impl Future<Output = io::Result<()>> + Send {
        use std::sync::atomic::Ordering;
        let result = if self.fail_writes.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only store"))
        } else {
            self.blobs.lock().unwrap().insert(name.to_string(), data);
            Ok(())
        };
        std::future::ready(result)
    }

    fn get(&self, name: &str) -> impl Future<Output = io::Result<Option<Bytes>>> + Send {
        use std::sync::atomic::Ordering;
        let result = if self.fail_reads.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        } else {
            Ok(self.value(name))
        };
        std::future::ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{collector, drain};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join(DEFAULT_DIRECTORY);
        let (sink, mut rx) = collector();

        let store = DirStore::open(&root, &sink).await.unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
        assert_eq!(drain(&mut rx), vec![Event::StoreCreated { directory: root.clone() }]);

        // Second open finds it already there
        DirStore::open(&root, &sink).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let tmp = TempDir::new().unwrap();
        let (sink, _rx) = collector();
        let store = DirStore::open(tmp.path(), &sink).await.unwrap();

        store.put("a.txt", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(store.get("a.txt").await.unwrap(), Some(Bytes::from_static(b"one")));

        store.put("a.txt", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.get("a.txt").await.unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let tmp = TempDir::new().unwrap();
        let (sink, _rx) = collector();
        let store = DirStore::open(tmp.path(), &sink).await.unwrap();
        assert_eq!(store.get("absent.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failures_surface_as_errors() {
        let tmp = TempDir::new().unwrap();
        let (sink, _rx) = collector();
        let store = DirStore::open(tmp.path(), &sink).await.unwrap();
        std::fs::create_dir(tmp.path().join("dir")).unwrap();

        // Missing parent directory
        assert!(store.put("nope/a.txt", Bytes::new()).await.is_err());
        // Exists, but is not a regular file
        assert!(store.get("dir").await.is_err());
    }
}
