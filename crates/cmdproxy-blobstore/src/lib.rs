//! Content-addressed blob store adapter.
//!
//! [`BlobStore`] is the seam between the transit pipelines (`cmdproxy-client`,
//! `cmdproxy-worker`) and whatever content store backs deployment — the real
//! backend is out of scope for this crate, which only defines the contract
//! and ships two implementations used across the workspace's tests:
//! [`InMemoryBlobStore`] and [`FsBlobStore`].
//!
//! Names are not assumed unique in the underlying store; [`BlobStore::put`]
//! always creates a new entry, and [`BlobStore::delete_by_name`] removes
//! every entry under that name. [`BlobStore::get`] must locate and return
//! the single *current* entry for a name.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use cmdproxy_error::CmdproxyError;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Opaque identifier returned by [`BlobStore::put`].
pub type BlobId = String;

/// Adapter contract over the underlying content store.
///
/// Implementations must be safe to share across concurrently-running `run`
/// calls; the workspace's async runtimes hold one shared handle per process.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name`, creating a new entry, and return its id.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<BlobId, CmdproxyError>;

    /// Fetch the current entry stored under `name`.
    ///
    /// Returns [`cmdproxy_error::ErrorCode::BlobMissing`] if no entry exists.
    async fn get(&self, name: &str) -> Result<Vec<u8>, CmdproxyError>;

    /// Returns `true` if an entry currently exists under `name`.
    async fn exists(&self, name: &str) -> Result<bool, CmdproxyError>;

    /// Delete every entry under `name`. Idempotent: deleting a name with no
    /// entries succeeds silently.
    async fn delete_by_name(&self, name: &str) -> Result<(), CmdproxyError>;
}

// ---------------------------------------------------------------------------
// InMemoryBlobStore
// ---------------------------------------------------------------------------

/// In-memory [`BlobStore`] used as the default test double across the
/// workspace. Each name maps to a stack of entries; `put` pushes, `get`
/// reads the top, `delete_by_name` clears the stack.
#[derive(Default)]
pub struct InMemoryBlobStore {
    entries: Mutex<HashMap<String, Vec<(BlobId, Vec<u8>)>>>,
    next_id: Mutex<u64>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the set of names that currently have at least one entry.
    ///
    /// Used by tests asserting the "no residual blobs" cleanup invariant.
    pub async fn names(&self) -> std::collections::BTreeSet<String> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    async fn alloc_id(&self) -> BlobId {
        let mut guard = self.next_id.lock().await;
        *guard += 1;
        format!("mem-{}", *guard)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<BlobId, CmdproxyError> {
        let id = self.alloc_id().await;
        self.entries
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .push((id.clone(), bytes));
        Ok(id)
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, CmdproxyError> {
        self.entries
            .lock()
            .await
            .get(name)
            .and_then(|entries| entries.last())
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| CmdproxyError::blob_missing(name))
    }

    async fn exists(&self, name: &str) -> Result<bool, CmdproxyError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(name)
            .is_some_and(|entries| !entries.is_empty()))
    }

    async fn delete_by_name(&self, name: &str) -> Result<(), CmdproxyError> {
        self.entries.lock().await.remove(name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FsBlobStore
// ---------------------------------------------------------------------------

/// Flat-file-per-name [`BlobStore`] for local manual testing of the CLI.
///
/// Blob names contain `@`, `:` and `/`, none of which are valid on every
/// filesystem as path separators within a single component, so names are
/// percent-escaped into a single file name under `root`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Use `root` as the backing directory, creating it if necessary.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, CmdproxyError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            CmdproxyError::execution_failure(format!("creating blob store root: {e}"))
                .with_source(e)
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(encode_name(name))
    }
}

fn encode_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_string()
            } else {
                format!("%{:02x}", c as u32)
            }
        })
        .collect()
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<BlobId, CmdproxyError> {
        let path = self.path_for(name);
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            CmdproxyError::execution_failure(format!("writing blob {name}: {e}")).with_source(e)
        })?;
        Ok(path.display().to_string())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, CmdproxyError> {
        let path = self.path_for(name);
        tokio::fs::read(&path)
            .await
            .map_err(|_| CmdproxyError::blob_missing(name))
    }

    async fn exists(&self, name: &str) -> Result<bool, CmdproxyError> {
        Ok(tokio::fs::try_exists(self.path_for(name)).await.unwrap_or(false))
    }

    async fn delete_by_name(&self, name: &str) -> Result<(), CmdproxyError> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CmdproxyError::execution_failure(format!(
                "deleting blob {name}: {e}"
            ))
            .with_source(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_put_get_roundtrip() {
        let store = InMemoryBlobStore::new();
        store.put("@host:/tmp/a", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("@host:/tmp/a").await.unwrap(), b"hello");
        assert!(store.exists("@host:/tmp/a").await.unwrap());
    }

    #[tokio::test]
    async fn missing_get_is_blob_missing() {
        let store = InMemoryBlobStore::new();
        let err = store.get("@host:/nope").await.unwrap_err();
        assert_eq!(err.code, cmdproxy_error::ErrorCode::BlobMissing);
    }

    #[tokio::test]
    async fn delete_by_name_is_idempotent() {
        let store = InMemoryBlobStore::new();
        store.delete_by_name("@host:/tmp/a").await.unwrap();
        store.put("@host:/tmp/a", b"x".to_vec()).await.unwrap();
        store.delete_by_name("@host:/tmp/a").await.unwrap();
        store.delete_by_name("@host:/tmp/a").await.unwrap();
        assert!(!store.exists("@host:/tmp/a").await.unwrap());
    }

    #[tokio::test]
    async fn put_creates_new_entry_not_unique() {
        let store = InMemoryBlobStore::new();
        let id1 = store.put("@host:/tmp/a", b"v1".to_vec()).await.unwrap();
        let id2 = store.put("@host:/tmp/a", b"v2".to_vec()).await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(store.get("@host:/tmp/a").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn fs_store_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).await.unwrap();
        store.put("@node42:/srv/r.bin", b"BIN".to_vec()).await.unwrap();
        assert!(store.exists("@node42:/srv/r.bin").await.unwrap());
        assert_eq!(store.get("@node42:/srv/r.bin").await.unwrap(), b"BIN");
        store.delete_by_name("@node42:/srv/r.bin").await.unwrap();
        assert!(!store.exists("@node42:/srv/r.bin").await.unwrap());
    }
}
