//! Content-addressed block datastore over remote object storage.
//!
//! Blocks written through the datastore land inline in a relational
//! metadata database. A background packer coalesces them into ZIP
//! archives ("packs") uploaded to an object store, recording each block's
//! pack object name and payload byte offset so later reads are served
//! with a single ranged download — the archive is never parsed on the
//! read path.
//!
//! # Features
//!
//! - IPFS-style block surface: put, get, has, size, delete, sync
//! - PostgreSQL / CockroachDB metadata backends, plus embedded SQLite for
//!   local and ephemeral deployments
//! - Pluggable pack storage: S3/MinIO, local filesystem, in-memory
//! - Packs are plain ZIP archives with `Stored` entries, readable by any
//!   standard ZIP tool
//!
//! # Example
//!
//! ```rust,no_run
//! use blockpack::{BlockDatastore, Config, Datastore, DatabaseConfig, StoreConfig};
//!
//! # async fn example() -> blockpack::Result<()> {
//! let store = Datastore::open(Config {
//!     database: DatabaseConfig::Url {
//!         url: "postgres://localhost/blocks".into(),
//!     },
//!     store: StoreConfig::S3 {
//!         endpoint: "http://localhost:9000".into(),
//!         access_key: "minioadmin".into(),
//!         secret_key: "minioadmin".into(),
//!         bucket: "packs".into(),
//!         region: None,
//!     },
//!     packer: Default::default(),
//! })
//! .await?;
//!
//! store.put("/bafyone", b"hello").await?;
//! store.sync("/").await?;
//! let data = store.get("/bafyone").await?;
//! # Ok(())
//! # }
//! ```

mod blocks;
mod datastore;
mod db;
mod error;
mod pack;
mod packer;
mod store;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use blocks::{Block, Blocks, PackStatus, PackedBlock, UnpackedBlock};
pub use datastore::Datastore;
pub use db::{rebind, Backend, DatabaseConfig, Db};
pub use error::{Error, Result};
pub use pack::build_pack;
pub use packer::PackerConfig;
pub use store::{PackObject, Storage, StoreConfig, PACK_CONTENT_TYPE};

/// Top-level datastore configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Metadata database.
    pub database: DatabaseConfig,
    /// Object store holding pack objects.
    pub store: StoreConfig,
    /// Background packer tuning.
    #[serde(default)]
    pub packer: PackerConfig,
}

/// The IPFS-style block datastore surface.
///
/// Keys are `/`-prefixed; the CID is the key with the leading slash
/// stripped.
#[async_trait]
pub trait BlockDatastore: Send + Sync {
    /// Store a block under its CID. Re-putting an existing CID is a
    /// no-op while the payload is inline; once packed it is a conflict.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch a block's payload, inline or from its pack.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Whether a live (non-deleted) block exists for the key.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Payload length without fetching the payload.
    async fn get_size(&self, key: &str) -> Result<u64>;

    /// Tombstone a block. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Flush the packer and wait: on return, every block put before the
    /// call is either packed and durable in the object store, or still
    /// inline because it did not meet pack criteria.
    async fn sync(&self, prefix: &str) -> Result<()>;
}
