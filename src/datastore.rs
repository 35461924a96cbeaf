//! The IPFS-style block datastore facade.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::blocks::{Blocks, PackStatus};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::packer::{Packer, PackerHandle};
use crate::store::Storage;
use crate::{BlockDatastore, Config};

/// How long a read waits for a row observed mid-flip to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_POLL: Duration = Duration::from_millis(50);

/// Block datastore bridging the IPFS block interface to a remote object
/// store, with small blocks coalesced into pack objects in the
/// background.
pub struct Datastore {
    db: Db,
    blocks: Blocks,
    storage: Storage,
    packer: PackerHandle,
}

impl Datastore {
    /// Open the datastore: connect and migrate the metadata database, set
    /// up the object store, and start the background packer.
    pub async fn open(config: Config) -> Result<Self> {
        config.packer.validate()?;

        let db = Db::connect(&config.database).await?;
        db.migrate().await?;

        let storage = Storage::new(config.store).await?;
        let blocks = Blocks::new(db.clone());
        let packer = Packer::spawn(blocks.clone(), storage.clone(), config.packer);

        Ok(Self {
            db,
            blocks,
            storage,
            packer,
        })
    }

    /// Typed access to block metadata rows.
    pub fn blocks(&self) -> &Blocks {
        &self.blocks
    }

    /// The object store holding uploaded packs.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Total payload bytes of all live blocks, inline or packed.
    pub async fn disk_usage(&self) -> Result<u64> {
        Ok(self.blocks.disk_usage().await? as u64)
    }

    /// Store an opaque metadata value outside the block namespace.
    pub async fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put_metadata(key, value).await
    }

    /// Fetch an opaque metadata value.
    pub async fn get_metadata(&self, key: &str) -> Result<Bytes> {
        self.db.get_metadata(key).await
    }

    /// Remove an opaque metadata value. Idempotent.
    pub async fn delete_metadata(&self, key: &str) -> Result<()> {
        self.db.delete_metadata(key).await
    }

    /// Stop the packer, draining any in-flight cycle, then close the
    /// database pool.
    pub async fn close(self) -> Result<()> {
        self.packer.shutdown().await;
        self.db.close().await;
        Ok(())
    }
}

/// Keys are `/`-prefixed; the CID is the key with the leading slash
/// stripped.
fn cid_of(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}

#[async_trait]
impl BlockDatastore for Datastore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let cid = cid_of(key);
        match self.blocks.insert(cid, value).await {
            Ok(()) => Ok(()),
            Err(Error::Conflict(_)) => match self.blocks.get(cid).await {
                // The CID is content-addressed: an existing inline row
                // already holds these bytes, so re-putting is a no-op.
                Ok(block) if block.status == PackStatus::Packed => Err(Error::Conflict(format!(
                    "block {cid} is already packed"
                ))),
                Ok(_) => Ok(()),
                // The row exists but is tombstoned; make it live again.
                Err(Error::NotFound(_)) => self.blocks.restore(cid).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let cid = cid_of(key);
        let deadline = Instant::now() + SETTLE_TIMEOUT;

        loop {
            let block = self.blocks.get(cid).await?;
            match block.status {
                PackStatus::Unpacked => {
                    return block.data.ok_or_else(|| {
                        Error::PermanentBackend(
                            format!("unpacked block {cid} has no inline data").into(),
                        )
                    });
                }
                PackStatus::Packing => {
                    // The payload stays inline until the commit clears it,
                    // so a missing payload means the row was observed
                    // mid-flip; poll until it settles.
                    if let Some(data) = block.data {
                        return Ok(data);
                    }
                }
                PackStatus::Packed => {
                    if block.size == 0 {
                        return Ok(Bytes::new());
                    }
                    return self
                        .storage
                        .get_range(&block.pack_object, block.pack_offset as u64, block.size as u64)
                        .await;
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::TransientBackend(
                    format!("block {cid} did not settle out of packing").into(),
                ));
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.blocks.has(cid_of(key)).await
    }

    async fn get_size(&self, key: &str) -> Result<u64> {
        Ok(self.blocks.size_of(cid_of(key)).await? as u64)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blocks.delete(cid_of(key)).await
    }

    async fn sync(&self, _prefix: &str) -> Result<()> {
        self.packer.flush().await
    }
}
