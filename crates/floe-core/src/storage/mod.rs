//! Blob storage abstraction.
//!
//! Provides a unified interface over Google Cloud Storage and the local
//! filesystem (used by tests). Paths handed to the provider are relative
//! to the configured key prefix.

mod gcs;
mod local;

pub use gcs::GcsConfig;
pub use local::LocalConfig;

use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Backend configuration for a storage provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a storage URL into a backend configuration.
    ///
    /// Supported forms: `gs://bucket/prefix` and plain filesystem paths.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(rest) = url.strip_prefix("gs://") {
            let (bucket, key) = match rest.split_once('/') {
                Some((bucket, key)) if !key.is_empty() => (bucket, Some(Path::from(key))),
                Some((bucket, _)) => (bucket, None),
                None => (rest, None),
            };
            ensure!(!bucket.is_empty(), InvalidUrlSnafu { url });
            Ok(BackendConfig::Gcs(GcsConfig {
                bucket: bucket.to_string(),
                key,
            }))
        } else if url.contains("://") {
            InvalidUrlSnafu { url }.fail()
        } else {
            Ok(BackendConfig::Local(LocalConfig {
                root: url.to_string(),
            }))
        }
    }

    /// Key prefix within the backend, if any.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::Gcs(config) => config.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

/// Storage provider that abstracts over blob storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::Gcs(config) => Self::construct_gcs(config),
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Full URI for a relative path, suitable for handing to external
    /// services (e.g. a BigQuery load job source URI).
    pub fn uri_for(&self, path: &Path) -> String {
        let qualified = self.qualify_path(path);
        match &self.config {
            BackendConfig::Gcs(config) => format!("gs://{}/{}", config.bucket, qualified),
            BackendConfig::Local(config) => {
                format!("file://{}/{}", config.root.trim_end_matches('/'), qualified)
            }
        }
    }

    /// Qualify a path with the configured key prefix.
    fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;
        self.record_request(StorageOperation::Get, result.is_ok(), start);

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Write an object. Objects are immutable once written; callers pick
    /// paths that are unique per batch.
    pub async fn put(&self, path: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(path), PutPayload::from(bytes))
            .await;
        self.record_request(StorageOperation::Put, result.is_ok(), start);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete an object.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self.object_store.delete(&self.qualify_path(path)).await;
        self.record_request(StorageOperation::Delete, result.is_ok(), start);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// List object paths under a prefix (relative to the configured key).
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<Path>, StorageError> {
        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: RequestStatus::Success,
        });

        let full_prefix: Path = match self.config.key() {
            Some(key) => key.parts().chain(Path::from(prefix).parts()).collect(),
            None => Path::from(prefix),
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let mut stream = self.object_store.list(Some(&full_prefix));
        let mut paths = Vec::new();
        while let Some(result) = stream.next().await {
            let meta = result.context(ObjectStoreSnafu)?;
            let relative: Path = meta.location.parts().skip(key_part_count).collect();
            paths.push(relative);
        }
        paths.sort_unstable_by(|a, b| a.as_ref().cmp(b.as_ref()));
        Ok(paths)
    }

    /// Probe that the backing bucket (or directory) is reachable.
    ///
    /// Bucket provisioning is a deployment concern; this surfaces a clear
    /// error at startup instead of failing on the first batch write.
    pub async fn probe(&self) -> Result<(), StorageError> {
        let prefix = self.config.key().cloned().unwrap_or_default();
        let mut stream = self.object_store.list(Some(&prefix));
        match stream.next().await {
            Some(Err(source)) if !matches!(source, object_store::Error::NotFound { .. }) => {
                Err(StorageError::ObjectStore { source })
            }
            _ => Ok(()),
        }
    }

    fn record_request(&self, operation: StorageOperation, ok: bool, start: Instant) {
        let status = if ok {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        };
        emit!(StorageRequest { operation, status });
        emit!(StorageRequestDuration {
            operation,
            duration: start.elapsed(),
        });
    }
}
