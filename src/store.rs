//! Remote object storage for pack objects.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Content type recorded on every uploaded pack object.
pub const PACK_CONTENT_TYPE: &str = "application/zip";

/// Configuration for the object-storage backend holding pack objects.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local filesystem storage
    Local {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        /// S3 endpoint URL (e.g., "http://localhost:9000" for MinIO)
        endpoint: String,
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Bucket name
        bucket: String,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
    },
}

/// A whole pack object as returned by [`Storage::get`].
#[derive(Debug, Clone)]
pub struct PackObject {
    /// The archive bytes.
    pub data: Bytes,
    /// Content type recorded at upload, if the backend kept it.
    pub content_type: Option<String>,
}

/// Handle on the remote store holding pack objects.
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
    // Local filesystems reject put attributes; everything else records
    // the pack content type.
    attributes: bool,
}

impl Storage {
    /// Create a storage backend from configuration.
    pub async fn new(config: StoreConfig) -> Result<Self> {
        let mut attributes = true;
        let inner: Arc<dyn ObjectStore> = match &config {
            StoreConfig::Memory => Arc::new(InMemory::new()),

            StoreConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                attributes = false;
                Arc::new(
                    LocalFileSystem::new_with_prefix(path)
                        .map_err(|e| Error::InvalidConfig(e.to_string()))?,
                )
            }

            StoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"));

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| Error::InvalidConfig(e.to_string()))?,
                );

                // Fail fast on a missing bucket instead of at the first
                // pack upload.
                {
                    let mut listing = store.list(None);
                    match listing.try_next().await {
                        Ok(_) => {}
                        Err(object_store::Error::NotFound { .. }) => {
                            return Err(Error::InvalidConfig(format!(
                                "bucket {bucket} does not exist"
                            )));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                store
            }
        };

        Ok(Self { inner, attributes })
    }

    fn pack_path(name: &str) -> ObjectPath {
        ObjectPath::from(name)
    }

    /// Upload a pack object under its final name.
    ///
    /// The backends used here expose an atomic single put: a reader never
    /// observes a partial object under `name`.
    pub(crate) async fn put_pack(&self, name: &str, blob: Bytes) -> Result<()> {
        let options = if self.attributes {
            PutOptions {
                attributes: Attributes::from_iter([(Attribute::ContentType, PACK_CONTENT_TYPE)]),
                ..Default::default()
            }
        } else {
            PutOptions::default()
        };
        self.inner
            .put_opts(&Self::pack_path(name), blob.into(), options)
            .await?;
        Ok(())
    }

    /// Fetch `length` bytes of a pack object starting at `offset`.
    pub async fn get_range(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        let range = offset..offset + length;
        Ok(self.inner.get_range(&Self::pack_path(name), range).await?)
    }

    /// Fetch a whole pack object.
    pub async fn get(&self, name: &str) -> Result<PackObject> {
        let result = self.inner.get(&Self::pack_path(name)).await?;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| value.as_ref().to_string());
        let data = result.bytes().await?;
        Ok(PackObject { data, content_type })
    }

    /// Stored size of a pack object in bytes.
    pub async fn stat(&self, name: &str) -> Result<u64> {
        Ok(self.inner.head(&Self::pack_path(name)).await?.size)
    }

    /// Delete a pack object. Deleting an absent object is not an error.
    pub(crate) async fn delete(&self, name: &str) -> Result<()> {
        match self.inner.delete(&Self::pack_path(name)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List the names of all stored pack objects.
    pub async fn list(&self) -> Result<Vec<String>> {
        let items: Vec<_> = self.inner.list(None).try_collect().await?;
        Ok(items
            .into_iter()
            .map(|meta| meta.location.as_ref().to_string())
            .collect())
    }
}

#[cfg(test)]
impl Storage {
    /// In-memory storage for unit tests.
    pub(crate) fn memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            attributes: true,
        }
    }

    /// Wrap an arbitrary backend, used to inject failures.
    pub(crate) fn with_inner(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            attributes: false,
        }
    }
}
