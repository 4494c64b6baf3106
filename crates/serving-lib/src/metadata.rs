//! Best-effort loading of the `metadata.yaml` sidecar
//!
//! Absence or corruption of the file never blocks serving; the resolver
//! logs the problem and returns an empty mapping.

use crate::error::MetadataError;
use crate::models::Metadata;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Sidecar file name, resolved relative to the model location
pub const METADATA_FILE_NAME: &str = "metadata.yaml";

#[derive(Debug, Clone)]
pub struct MetadataResolver {
    file_path: PathBuf,
}

impl MetadataResolver {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: base_path.as_ref().join(METADATA_FILE_NAME),
        }
    }

    /// Read the sidecar, returning an empty mapping on any failure
    pub fn resolve(&self) -> Metadata {
        match self.try_resolve() {
            Ok(metadata) => metadata,
            Err(e @ MetadataError::NotFound(_)) => {
                debug!(error = %e, "No metadata sidecar");
                Metadata::new()
            }
            Err(e) => {
                error!(error = %e, "Ignoring unreadable metadata sidecar");
                Metadata::new()
            }
        }
    }

    fn try_resolve(&self) -> Result<Metadata, MetadataError> {
        let path = &self.file_path;
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                MetadataError::NotFound(path.clone())
            } else {
                MetadataError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        let value: serde_json::Value =
            serde_yaml::from_str(&content).map_err(|source| MetadataError::Parse {
                path: path.clone(),
                source,
            })?;

        match value {
            serde_json::Value::Object(map) => Ok(map),
            // an empty document is treated like an empty mapping
            serde_json::Value::Null => Ok(Metadata::new()),
            _ => Err(MetadataError::NotAMapping(path.clone())),
        }
    }
}
