//! Filesystem blob store
//!
//! Each blob is a file under the root directory, with a `.meta.json`
//! sidecar holding its content type, user metadata and SHA-256 digest.
//! Reads verify the digest.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Blob, BlobMeta, BlobStore, Disposition, UrlSigner};
use crate::error::{PostboxError, PostboxResult};

const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    #[serde(flatten)]
    meta: BlobMeta,
    sha256: String,
}

/// Blob store rooted at a local directory
pub struct FsBlobStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, signer: UrlSigner) -> PostboxResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, signer })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PostboxResult<PathBuf> {
        let bad_segment = |segment: &str| segment.is_empty() || segment == "." || segment == "..";
        if key.is_empty() || key.starts_with('/') || key.split('/').any(bad_segment) {
            return Err(PostboxError::validation(format!("Invalid blob key: {}", key)));
        }
        Ok(self.root.join(key))
    }

    fn sidecar_for(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_sidecar(&self, key: &str) -> PostboxResult<Sidecar> {
        let path = Self::sidecar_for(&self.path_for(key)?);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(PostboxError::not_found(format!("blob {}", key))),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: &[u8], meta: BlobMeta) -> PostboxResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sidecar = Sidecar {
            meta,
            sha256: digest(data),
        };
        tokio::fs::write(&path, data).await?;
        tokio::fs::write(Self::sidecar_for(&path), serde_json::to_vec(&sidecar)?).await?;
        Ok(())
    }
}

fn digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes, meta: BlobMeta) -> PostboxResult<()> {
        self.write(key, &data, meta).await?;
        tracing::debug!("Stored blob {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> PostboxResult<Blob> {
        let sidecar = self.read_sidecar(key).await?;
        let data = match tokio::fs::read(self.path_for(key)?).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PostboxError::not_found(format!("blob {}", key)))
            }
            Err(e) => return Err(e.into()),
        };
        if digest(&data) != sidecar.sha256 {
            return Err(PostboxError::blob(format!("Checksum mismatch for {}", key)));
        }
        Ok(Blob {
            data: Bytes::from(data),
            meta: sidecar.meta,
        })
    }

    async fn head(&self, key: &str) -> PostboxResult<BlobMeta> {
        Ok(self.read_sidecar(key).await?.meta)
    }

    async fn copy(&self, source: &str, destination: &str, meta: Option<BlobMeta>) -> PostboxResult<()> {
        let blob = self.get(source).await?;
        self.write(destination, &blob.data, meta.unwrap_or(blob.meta)).await
    }

    async fn delete(&self, key: &str) -> PostboxResult<()> {
        let path = self.path_for(key)?;
        for target in [Self::sidecar_for(&path), path] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn presign(&self, key: &str, disposition: &Disposition, ttl: Duration) -> PostboxResult<String> {
        self.path_for(key)?;
        self.signer.sign(key, &disposition.header_value(), ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FsBlobStore {
        let signer = UrlSigner::new("https://blobs.example.org/", "secret").unwrap();
        FsBlobStore::new(dir.path().join("blobs"), signer).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_head() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let meta = BlobMeta::json().with("recipient", "me@x.org");
        store
            .put("me@x.org/2025-01-01/abc.json", Bytes::from_static(b"{}"), meta.clone())
            .await
            .unwrap();

        let blob = store.get("me@x.org/2025-01-01/abc.json").await.unwrap();
        assert_eq!(blob.data, Bytes::from_static(b"{}"));
        assert_eq!(blob.meta, meta);
        assert_eq!(store.head("me@x.org/2025-01-01/abc.json").await.unwrap(), meta);
    }

    #[tokio::test]
    async fn test_missing_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.get("nobody/x.json").await.unwrap_err().is_not_found());

        store.put("a/b", Bytes::from_static(b"x"), BlobMeta::new("text/plain")).await.unwrap();
        store.delete("a/b").await.unwrap();
        store.delete("a/b").await.unwrap();
        assert!(store.head("a/b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_copy_replaces_meta() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("p/f.pdf", Bytes::from_static(b"pdf"), BlobMeta::new("application/pdf")).await.unwrap();
        let replaced = BlobMeta::new("application/pdf").with("content-id", "<img1>");
        store.copy("p/f.pdf", "q/f.pdf", Some(replaced.clone())).await.unwrap();
        assert_eq!(store.head("q/f.pdf").await.unwrap(), replaced);
        assert_eq!(store.get("q/f.pdf").await.unwrap().data, Bytes::from_static(b"pdf"));
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("k/v", Bytes::from_static(b"one"), BlobMeta::new("text/plain")).await.unwrap();
        std::fs::write(store.root().join("k/v"), b"two").unwrap();
        assert!(matches!(store.get("k/v").await, Err(PostboxError::Blob(_))));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for key in ["../escape", "me@x.org/r1/", "me@x.org/./a", "/abs"] {
            let result = store.put(key, Bytes::new(), BlobMeta::default()).await;
            assert!(result.is_err(), "{} should be rejected", key);
        }
    }
}
