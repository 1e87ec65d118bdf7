use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};

const OCTET_STREAM: &str = "application/octet-stream";

/// Where a stored blob can be read from.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobLocation {
    LocalPath(PathBuf),
    Url(String),
}

/// Key/value storage for input and result artifacts.
///
/// Keys follow `originals/{job_id}[/{n}]` and `results/{job_id}`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    /// Download a blob into a local file. Fails with [`StorageError::NotFound`] if absent.
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<(), StorageError>;

    async fn locate(&self, key: &str) -> Result<BlobLocation, StorageError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Delete a blob. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Filesystem-backed blob store rooted at a directory.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;
        tokio::fs::copy(source, &path).await?;
        Ok(())
    }

    async fn get_to_file(&self, key: &str, destination: &Path) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Self::ensure_parent(destination).await?;
        tokio::fs::copy(&path, destination).await?;
        Ok(())
    }

    async fn locate(&self, key: &str) -> Result<BlobLocation, StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(BlobLocation::LocalPath(path))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.path_for(from)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(from.to_string()));
        }
        let target = self.path_for(to)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::copy(&source, &target).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let result = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Client for S3-compatible object storage (AWS S3, Cloudflare R2, MinIO).
pub struct S3BlobStore {
    bucket: Box<Bucket>,
    presign_expiry_secs: u32,
}

impl S3BlobStore {
    pub fn new(
        bucket_name: &str,
        region: &str,
        endpoint: Option<&str>,
        access_key: Option<&str>,
        secret_key: Option<&str>,
        path_style: bool,
    ) -> Result<Self, StorageError> {
        let region = match endpoint {
            Some(endpoint) => Region::Custom {
                region: region.to_string(),
                endpoint: endpoint.to_string(),
            },
            None => region
                .parse()
                .map_err(|e| StorageError::Config(format!("invalid region {region}: {e}")))?,
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        if path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self {
            bucket,
            presign_expiry_secs: 3600,
        })
    }

    fn classify(key: &str, error: S3Error) -> StorageError {
        match error {
            S3Error::HttpFailWithBody(404, _) => StorageError::NotFound(key.to_string()),
            other => StorageError::S3(other),
        }
    }
}

/// Map an S3 reply code to a result. Without `fail-on-err`, rust-s3 hands error replies
/// back as `Ok`, so every call that returns a code goes through here.
fn check_status(key: &str, code: u16) -> Result<(), StorageError> {
    match code {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Status {
            key: key.to_string(),
            code,
        }),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, &data, OCTET_STREAM)
            .await
            .map_err(StorageError::S3)?;
        check_status(key, response.status_code())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let data = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(data)).await
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<(), StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| Self::classify(key, e))?;
        check_status(key, response.status_code())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, response.to_vec()).await?;
        Ok(())
    }

    async fn locate(&self, key: &str) -> Result<BlobLocation, StorageError> {
        let url = self
            .bucket
            .presign_get(key, self.presign_expiry_secs, None)
            .await
            .map_err(StorageError::S3)?;
        Ok(BlobLocation::Url(url))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let code = self
            .bucket
            .copy_object_internal(from, to)
            .await
            .map_err(|e| Self::classify(from, e))?;
        check_status(from, code)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.bucket.delete_object(key).await {
            Ok(response) => match check_status(key, response.status_code()) {
                Err(StorageError::NotFound(_)) => Ok(()),
                other => other,
            },
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(StorageError::S3(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage key not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("S3 operation failed: {0}")]
    S3(#[from] S3Error),

    #[error("S3 returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_then_fetch_to_file() {
        let (dir, store) = store();
        store
            .put("originals/abc", Bytes::from_static(b"pixels"))
            .await
            .unwrap();

        let target = dir.path().join("scratch/input");
        store.get_to_file("originals/abc", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (dir, store) = store();
        let err = store
            .get_to_file("originals/missing", &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(key) if key == "originals/missing"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_removes_prefixes() {
        let (_dir, store) = store();
        store
            .put("originals/job/0", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put("originals/job/1", Bytes::from_static(b"b"))
            .await
            .unwrap();

        store.delete("originals/job").await.unwrap();
        store.delete("originals/job").await.unwrap();
        assert!(matches!(
            store.locate("originals/job/0").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_copy_duplicates_blob() {
        let (_dir, store) = store();
        store
            .put("originals/a", Bytes::from_static(b"data"))
            .await
            .unwrap();
        store.copy("originals/a", "originals/b").await.unwrap();

        match store.locate("originals/b").await.unwrap() {
            BlobLocation::LocalPath(path) => assert_eq!(std::fs::read(path).unwrap(), b"data"),
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejects_traversal_keys() {
        let (_dir, store) = store();
        let err = store
            .put("../escape", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn test_s3_error_replies_are_not_success() {
        assert!(check_status("results/a", 200).is_ok());
        assert!(check_status("results/a", 204).is_ok());
        assert!(matches!(
            check_status("results/a", 404),
            Err(StorageError::NotFound(key)) if key == "results/a"
        ));
        assert!(matches!(
            check_status("results/a", 403),
            Err(StorageError::Status { code: 403, .. })
        ));
        assert!(matches!(
            check_status("results/a", 500),
            Err(StorageError::Status { code: 500, .. })
        ));
    }
}
