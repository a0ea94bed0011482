//! Pluggable raw-blob storage. Local filesystem in dev; an object-store
//! backend satisfies the same trait in production. Blobs hold verbatim
//! payload bytes for replay and are write-once per checksum.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use pulso_core::model::DataType;
use pulso_core::{CoreError, CoreResult};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist verbatim bytes, returning the storage location recorded on
    /// the SourceRef.
    async fn put(
        &self,
        data_type: DataType,
        fetched_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> CoreResult<String>;

    async fn get(&self, location: &str) -> CoreResult<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<data_type>_<epoch_ms>.json`, UTF-8, verbatim.
    pub fn relative_path(data_type: DataType, fetched_at: DateTime<Utc>) -> PathBuf {
        PathBuf::from(format!(
            "{}_{}.json",
            data_type.as_str(),
            fetched_at.timestamp_millis()
        ))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        data_type: DataType,
        fetched_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> CoreResult<String> {
        let relative = Self::relative_path(data_type, fetched_at);
        let absolute = self.root.join(&relative);

        write_atomic(&self.root, &absolute, bytes)
            .await
            .map_err(CoreError::transient)?;
        Ok(relative.display().to_string())
    }

    async fn get(&self, location: &str) -> CoreResult<Vec<u8>> {
        let path = self.root.join(location);
        fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("blob {location}"))
            } else {
                CoreError::transient(err)
            }
        })
    }
}

/// Temp-file write + atomic rename. A rename that loses the race to an
/// existing file is fine: blobs are write-once per checksum, so the bytes
/// already on disk are the same bytes.
async fn write_atomic(root: &Path, absolute: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::create_dir_all(root)
        .await
        .with_context(|| format!("creating blob root {}", root.display()))?;

    let temp_path = root.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp blob {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp blob {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp blob {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, absolute).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming blob {} -> {}",
                    temp_path.display(),
                    absolute.display()
                )
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).single().unwrap()
    }

    #[test]
    fn layout_is_data_type_and_epoch_millis() {
        let rel = LocalBlobStore::relative_path(DataType::Products, fetched_at());
        assert_eq!(
            rel,
            PathBuf::from(format!("products_{}.json", fetched_at().timestamp_millis()))
        );
    }

    #[tokio::test]
    async fn round_trips_verbatim_bytes() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());
        let payload = br#"{"products":[{"id":1}]}"#;

        let location = store
            .put(DataType::Products, fetched_at(), payload)
            .await
            .expect("put");
        let read_back = store.get(&location).await.expect("get");
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn rewrite_of_same_location_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());
        let payload = b"same bytes";

        let first = store
            .put(DataType::Orders, fetched_at(), payload)
            .await
            .expect("first put");
        let second = store
            .put(DataType::Orders, fetched_at(), payload)
            .await
            .expect("second put");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = LocalBlobStore::new(dir.path());
        let err = store.get("products_0.json").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
