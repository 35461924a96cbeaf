//! Background coalescing of small blocks into pack objects.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blocks::{Blocks, PackedBlock, UnpackedBlock};
use crate::error::{Error, Result};
use crate::pack::build_pack;
use crate::store::Storage;

/// Rows fetched per scan query while collecting a batch.
const SCAN_PAGE: i64 = 64;

/// Packer tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Wake period of the background loop.
    pub interval: Duration,
    /// Minimum aggregate block bytes required to emit a pack.
    pub min_pack_size: u64,
    /// Hard cap on aggregate block bytes per pack.
    pub max_pack_size: u64,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_pack_size: 60 * 1024 * 1024,
            max_pack_size: 62 * 1024 * 1024,
        }
    }
}

impl PackerConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig("pack interval must be non-zero".into()));
        }
        if self.min_pack_size > self.max_pack_size {
            return Err(Error::InvalidConfig(format!(
                "min pack size {} exceeds max pack size {}",
                self.min_pack_size, self.max_pack_size
            )));
        }
        Ok(())
    }
}

pub(crate) enum Command {
    /// Run a cycle now and report its outcome.
    Flush(oneshot::Sender<Result<()>>),
}

/// Handle on a spawned packer task.
pub(crate) struct PackerHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl PackerHandle {
    /// Run a cycle immediately, after any cycle already in flight, and
    /// wait for it to complete.
    pub(crate) async fn flush(&self) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Flush(reply))
            .await
            .map_err(|_| Error::Cancelled)?;
        result.await.map_err(|_| Error::Cancelled)?
    }

    /// Stop the packer, draining any in-flight cycle first.
    pub(crate) async fn shutdown(self) {
        drop(self.commands);
        if let Err(error) = self.task.await {
            warn!(%error, "packer task failed during shutdown");
        }
    }
}

/// The background worker owning the pack state machine. One instance per
/// datastore; at most one cycle runs at a time.
pub(crate) struct Packer {
    blocks: Blocks,
    storage: Storage,
    config: PackerConfig,
    #[cfg(test)]
    fail_next_commit: std::sync::atomic::AtomicBool,
}

impl Packer {
    /// Spawn the packer loop onto the current runtime.
    pub(crate) fn spawn(blocks: Blocks, storage: Storage, config: PackerConfig) -> PackerHandle {
        let (commands, receiver) = mpsc::channel(16);
        let packer = Packer {
            blocks,
            storage,
            config,
            #[cfg(test)]
            fail_next_commit: std::sync::atomic::AtomicBool::new(false),
        };
        let task = tokio::spawn(packer.run(receiver));
        PackerHandle { commands, task }
    }

    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?self.config.interval, "packer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.cycle().await {
                        warn!(%error, "pack cycle failed");
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Flush(reply)) => {
                        let result = self.cycle().await;
                        if let Err(error) = &result {
                            warn!(%error, "pack cycle failed");
                        }
                        let _ = reply.send(result);
                    }
                    // All senders gone: the datastore is closing.
                    None => break,
                },
            }
        }

        debug!("packer stopped");
    }

    /// One cycle: emit packs until the remaining eligible batch is below
    /// the minimum pack size.
    async fn cycle(&self) -> Result<()> {
        loop {
            let batch = self.scan().await?;
            let total: u64 = batch.iter().map(|block| block.size as u64).sum();
            if total < self.config.min_pack_size {
                if !batch.is_empty() {
                    debug!(
                        blocks = batch.len(),
                        bytes = total,
                        "batch below minimum pack size, leaving inline"
                    );
                }
                return Ok(());
            }
            self.pack_batch(batch).await?;
        }
    }

    /// Collect unpacked blocks in insertion order until adding the next
    /// one would push the batch over the maximum pack size.
    async fn scan(&self) -> Result<Vec<UnpackedBlock>> {
        let mut batch = Vec::new();
        let mut total: u64 = 0;
        let mut offset = 0;

        'pages: loop {
            let page = self.blocks.list_unpacked(SCAN_PAGE, offset).await?;
            let page_len = page.len() as i64;
            offset += page_len;

            for block in page {
                let size = block.size as u64;
                if size > self.config.max_pack_size {
                    warn!(
                        cid = %block.cid,
                        size,
                        max = self.config.max_pack_size,
                        "block exceeds maximum pack size, leaving unpacked"
                    );
                    continue;
                }
                if total + size > self.config.max_pack_size {
                    break 'pages;
                }
                total += size;
                batch.push(block);
            }

            if page_len < SCAN_PAGE {
                break;
            }
        }

        Ok(batch)
    }

    /// Claim, build, upload, and commit one batch. Any failure returns
    /// every block this cycle claimed to Unpacked.
    async fn pack_batch(&self, batch: Vec<UnpackedBlock>) -> Result<()> {
        let cids: Vec<String> = batch.iter().map(|block| block.cid.clone()).collect();
        let claimed = self.blocks.claim_for_packing(&cids).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        // Another packer sharing the database may have advanced some of
        // the candidates between scan and claim; pack what we got.
        let batch = if claimed.len() == cids.len() {
            batch
        } else {
            let keep: HashSet<&str> = claimed.iter().map(String::as_str).collect();
            batch
                .into_iter()
                .filter(|block| keep.contains(block.cid.as_str()))
                .collect()
        };

        let result = self.upload_batch(&batch).await;
        if result.is_err() {
            if let Err(abort_error) = self.blocks.abort_packing(&claimed).await {
                warn!(%abort_error, "failed to return claimed blocks to unpacked");
            }
        }
        result
    }

    async fn upload_batch(&self, batch: &[UnpackedBlock]) -> Result<()> {
        let (blob, offsets) = build_pack(batch)?;
        let name = format!("{}.zip", Uuid::new_v4().simple());
        let blob_len = blob.len();

        self.storage.put_pack(&name, blob).await?;

        let mut packed = Vec::with_capacity(batch.len());
        for block in batch {
            let pack_offset = offsets.get(&block.cid).copied().ok_or_else(|| {
                Error::PermanentBackend(format!("pack entry missing for {}", block.cid).into())
            })?;
            packed.push(PackedBlock {
                cid: block.cid.clone(),
                pack_object: name.clone(),
                pack_offset: pack_offset as i64,
            });
        }

        if let Err(commit_error) = self.commit(&packed).await {
            // The rows still point at inline data; drop the unreferenced
            // pack. If this delete fails too the object leaks until an
            // out-of-band sweep.
            if let Err(delete_error) = self.storage.delete(&name).await {
                warn!(pack = %name, %delete_error, "failed to delete uncommitted pack object");
            }
            return Err(commit_error);
        }

        info!(pack = %name, blocks = batch.len(), bytes = blob_len, "uploaded pack");
        Ok(())
    }

    async fn commit(&self, packed: &[PackedBlock]) -> Result<()> {
        #[cfg(test)]
        if self
            .fail_next_commit
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::TransientBackend("injected commit failure".into()));
        }

        self.blocks.commit_packed(packed).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use object_store::aws::AmazonS3Builder;
    use object_store::RetryConfig;

    use super::*;
    use crate::blocks::PackStatus;
    use crate::db::Db;

    async fn fixture(min_pack_size: u64, max_pack_size: u64) -> (Blocks, Storage, Packer) {
        let db = Db::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        let blocks = Blocks::new(db);
        let storage = Storage::memory();
        let packer = Packer {
            blocks: blocks.clone(),
            storage: storage.clone(),
            config: PackerConfig {
                interval: Duration::from_millis(100),
                min_pack_size,
                max_pack_size,
            },
            fail_next_commit: AtomicBool::new(false),
        };
        (blocks, storage, packer)
    }

    fn payload(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    #[tokio::test]
    async fn packs_batch_when_minimum_met() {
        let (blocks, storage, packer) = fixture(1024, 4096).await;
        for i in 0..4 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        packer.cycle().await.unwrap();

        let packs = storage.list().await.unwrap();
        assert_eq!(packs.len(), 1);

        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Packed, "block{i}");
            assert!(block.data.is_none());
            assert_eq!(block.pack_object, packs[0]);
            assert!(block.pack_offset > 0);

            let data = storage
                .get_range(&block.pack_object, block.pack_offset as u64, block.size as u64)
                .await
                .unwrap();
            assert_eq!(data.as_ref(), payload(512, i as u8).as_slice());
        }
    }

    #[tokio::test]
    async fn no_pack_below_minimum() {
        let (blocks, storage, packer) = fixture(1024, 4096).await;
        blocks.insert("block0", &payload(512, 1)).await.unwrap();

        packer.cycle().await.unwrap();

        assert!(storage.list().await.unwrap().is_empty());
        let block = blocks.get("block0").await.unwrap();
        assert_eq!(block.status, PackStatus::Unpacked);
        assert!(block.data.is_some());
    }

    #[tokio::test]
    async fn respects_maximum_pack_size() {
        let (blocks, storage, packer) = fixture(1024, 2048).await;
        for i in 0..5 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        packer.cycle().await.unwrap();

        assert_eq!(storage.list().await.unwrap().len(), 1);
        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Packed, "block{i}");
        }
        // The fifth block alone is below the minimum.
        let block = blocks.get("block4").await.unwrap();
        assert_eq!(block.status, PackStatus::Unpacked);
    }

    #[tokio::test]
    async fn drains_all_eligible_batches_in_one_cycle() {
        let (blocks, storage, packer) = fixture(512, 1024).await;
        for i in 0..4 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        packer.cycle().await.unwrap();

        assert_eq!(storage.list().await.unwrap().len(), 2);
        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Packed, "block{i}");
        }
    }

    #[tokio::test]
    async fn skips_oversized_blocks() {
        let (blocks, storage, packer) = fixture(1024, 2048).await;
        blocks.insert("huge", &payload(3000, 0xff)).await.unwrap();
        for i in 0..4 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        packer.cycle().await.unwrap();

        let huge = blocks.get("huge").await.unwrap();
        assert_eq!(huge.status, PackStatus::Unpacked);
        assert!(huge.data.is_some());

        assert_eq!(storage.list().await.unwrap().len(), 1);
        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Packed, "block{i}");
        }
    }

    #[tokio::test]
    async fn skips_deleted_blocks() {
        let (blocks, storage, packer) = fixture(1024, 4096).await;
        blocks.insert("gone", &payload(2048, 3)).await.unwrap();
        blocks.delete("gone").await.unwrap();

        packer.cycle().await.unwrap();

        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_returns_blocks_to_unpacked() {
        let (blocks, _, mut packer) = fixture(1024, 4096).await;

        // An S3 store pointing at a closed port: every put fails.
        let unreachable = AmazonS3Builder::new()
            .with_endpoint("http://127.0.0.1:1")
            .with_allow_http(true)
            .with_bucket_name("missing")
            .with_access_key_id("test")
            .with_secret_access_key("test")
            .with_region("us-east-1")
            .with_retry(RetryConfig {
                max_retries: 0,
                ..Default::default()
            })
            .build()
            .unwrap();
        packer.storage = Storage::with_inner(Arc::new(unreachable));

        for i in 0..4 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        packer.cycle().await.unwrap_err();

        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Unpacked, "block{i}");
            assert!(block.data.is_some());
        }
    }

    #[tokio::test]
    async fn commit_failure_drops_pack_and_next_cycle_retries() {
        let (blocks, storage, packer) = fixture(1024, 4096).await;
        for i in 0..4 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        packer.fail_next_commit.store(true, Ordering::SeqCst);
        packer.cycle().await.unwrap_err();

        // The claimed rows are candidates again and the uncommitted pack
        // object is gone.
        assert!(storage.list().await.unwrap().is_empty());
        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Unpacked, "block{i}");
            assert!(block.data.is_some());
        }

        packer.cycle().await.unwrap();

        let packs = storage.list().await.unwrap();
        assert_eq!(packs.len(), 1);
        for i in 0..4 {
            let block = blocks.get(&format!("block{i}")).await.unwrap();
            assert_eq!(block.status, PackStatus::Packed, "block{i}");
            assert_eq!(block.pack_object, packs[0]);
        }
    }

    #[tokio::test]
    async fn packs_only_the_claimed_subset_under_contention() {
        let (blocks, storage, packer) = fixture(1024, 4096).await;
        for i in 0..3 {
            blocks
                .insert(&format!("block{i}"), &payload(512, i as u8))
                .await
                .unwrap();
        }

        // Another packer grabbed block1 between our scan and claim.
        let batch = packer.scan().await.unwrap();
        assert_eq!(batch.len(), 3);
        blocks
            .claim_for_packing(&["block1".to_string()])
            .await
            .unwrap();

        packer.pack_batch(batch).await.unwrap();

        assert_eq!(blocks.get("block0").await.unwrap().status, PackStatus::Packed);
        assert_eq!(blocks.get("block2").await.unwrap().status, PackStatus::Packed);

        let contended = blocks.get("block1").await.unwrap();
        assert_eq!(contended.status, PackStatus::Packing);
        assert!(contended.data.is_some());
        assert_eq!(contended.pack_object, "");

        assert_eq!(storage.list().await.unwrap().len(), 1);
    }
}
