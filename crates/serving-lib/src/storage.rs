//! Artifact store and reference source collaborators
//!
//! Locations are plain filesystem paths, `file://` URLs or `http(s)://`
//! URLs. Remote artifacts are downloaded into a local cache directory.

use crate::error::StorageError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Resolves an artifact URI to a local filesystem path
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn download(&self, uri: &str) -> Result<PathBuf, StorageError>;
}

/// Fetches the raw bytes of the reference table
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StorageError>;
}

/// A parsed storage location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Http(Url),
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if !raw.contains("://") {
            return Ok(Location::Local(PathBuf::from(raw)));
        }
        let url = Url::parse(raw).map_err(|e| StorageError::InvalidLocation(e.to_string()))?;
        match url.scheme() {
            "file" => url
                .to_file_path()
                .map(Location::Local)
                .map_err(|_| StorageError::InvalidLocation(raw.to_string())),
            "http" | "https" => Ok(Location::Http(url)),
            other => Err(StorageError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Default storage backend for local and HTTP locations
pub struct Storage {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl Storage {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
        })
    }

    async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, StorageError> {
        debug!(url = %url, "Fetching remote object");
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(StorageError::HttpStatus(response.status().as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ArtifactStore for Storage {
    async fn download(&self, uri: &str) -> Result<PathBuf, StorageError> {
        match Location::parse(uri)? {
            Location::Local(path) => {
                if !tokio::fs::try_exists(&path).await? {
                    return Err(StorageError::NotFound(path));
                }
                Ok(path)
            }
            Location::Http(url) => {
                let file_name = url
                    .path_segments()
                    .and_then(|mut s| s.next_back())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("model.onnx")
                    .to_string();
                let bytes = self.get_bytes(&url).await?;

                tokio::fs::create_dir_all(&self.cache_dir).await?;
                let target = self.cache_dir.join(file_name);
                tokio::fs::write(&target, &bytes).await?;
                info!(
                    url = %url,
                    path = %target.display(),
                    size = bytes.len(),
                    "Artifact downloaded"
                );
                Ok(target)
            }
        }
    }
}

#[async_trait]
impl ReferenceSource for Storage {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, StorageError> {
        match Location::parse(location)? {
            Location::Local(path) => match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(StorageError::NotFound(path))
                }
                Err(e) => Err(e.into()),
            },
            Location::Http(url) => self.get_bytes(&url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            Location::parse("/mnt/models").unwrap(),
            Location::Local(PathBuf::from("/mnt/models"))
        );
        assert_eq!(
            Location::parse("file:///mnt/models/model.onnx").unwrap(),
            Location::Local(PathBuf::from("/mnt/models/model.onnx"))
        );
        assert!(matches!(
            Location::parse("https://example.com/data/vocab.csv").unwrap(),
            Location::Http(_)
        ));
        assert!(matches!(
            Location::parse("gs://bucket/model"),
            Err(StorageError::UnsupportedScheme(s)) if s == "gs"
        ));
    }

    #[tokio::test]
    async fn test_download_local_path() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("cache")).unwrap();
        let uri = dir.path().to_string_lossy().to_string();

        let path = storage.download(&uri).await.unwrap();
        assert_eq!(path, dir.path());
    }

    #[tokio::test]
    async fn test_download_missing_path() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("cache")).unwrap();
        let missing = dir.path().join("nope");

        let err = storage
            .download(&missing.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fetch_local_reference() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("vocab.csv");
        tokio::fs::write(&file, "store_id,product_id\n1,2\n").await.unwrap();
        let storage = Storage::new(dir.path().join("cache")).unwrap();

        let bytes = storage.fetch(&file.to_string_lossy()).await.unwrap();
        assert_eq!(bytes, b"store_id,product_id\n1,2\n");

        let err = storage
            .fetch(&dir.path().join("missing.csv").to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
