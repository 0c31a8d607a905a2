//! A thin wrapper around [`object_store`] providing the put/list/delete
//! surface the pipeline needs, rooted at a single bucket path.

use anyhow::{Context, Result};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    root: Path,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore").field("root", &self.root).finish()
    }
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { store, root }
    }

    /// Parses a `s3://bucket/prefix`-style URL (or `file://`, `memory://`
    /// for tests) into a store handle. `GCS_ENABLED=false` is handled by
    /// the caller choosing a `memory://` or local-filesystem URL here.
    pub fn connect(object_store_url: &str) -> Result<Self> {
        let (store, root) = object_store::parse_url(&url::Url::parse(object_store_url)?)
            .with_context(|| format!("parsing object store url {object_store_url}"))?;
        Ok(Self {
            store: store.into(),
            root,
        })
    }

    fn full_path(&self, obj_path: &str) -> Path {
        if self.root.as_ref().is_empty() {
            Path::from(obj_path)
        } else {
            Path::from(format!("{}/{obj_path}", self.root))
        }
    }

    pub async fn put(&self, obj_path: &str, buffer: bytes::Bytes) -> Result<()> {
        self.store.put(&self.full_path(obj_path), buffer.into()).await?;
        Ok(())
    }

    pub async fn get(&self, obj_path: &str) -> Result<bytes::Bytes> {
        let result = self.store.get(&self.full_path(obj_path)).await?;
        Ok(result.bytes().await?)
    }

    pub async fn exists(&self, obj_path: &str) -> Result<bool> {
        match self.store.head(&self.full_path(obj_path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, obj_path: &str) -> Result<()> {
        match self.store.delete(&self.full_path(obj_path)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all objects under `prefix` (relative to the store root).
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        use futures::TryStreamExt;
        let full_prefix = self.full_path(prefix);
        let metas: Vec<ObjectMeta> = self
            .store
            .list(Some(&full_prefix))
            .try_collect()
            .await
            .with_context(|| format!("listing {prefix}"))?;
        Ok(metas)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inner(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()), Path::from("root"))
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let s = store();
        s.put("a/b.txt", bytes::Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let got = s.get("a/b.txt").await.unwrap();
        assert_eq!(&got[..], b"hello");
    }

    #[tokio::test]
    async fn exists_reflects_presence() {
        let s = store();
        assert!(!s.exists("missing").await.unwrap());
        s.put("present", bytes::Bytes::from_static(b"x")).await.unwrap();
        assert!(s.exists("present").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let s = store();
        s.put("x", bytes::Bytes::from_static(b"x")).await.unwrap();
        s.delete("x").await.unwrap();
        s.delete("x").await.unwrap();
        assert!(!s.exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn list_returns_objects_under_prefix() {
        let s = store();
        s.put("p/a", bytes::Bytes::from_static(b"1")).await.unwrap();
        s.put("p/b", bytes::Bytes::from_static(b"2")).await.unwrap();
        s.put("q/c", bytes::Bytes::from_static(b"3")).await.unwrap();
        let listed = s.list("p").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
