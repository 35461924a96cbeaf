//! Typed access to the `blocks` table.

use bytes::Bytes;
use sqlx::Row;

use crate::db::Db;
use crate::error::{Error, Result};

/// Placement state of a block.
///
/// The integer values are stored in the database and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackStatus {
    /// The payload lives inline in the metadata database.
    #[default]
    Unpacked,
    /// The block is claimed by an in-flight pack build.
    Packing,
    /// The payload lives at `(pack_object, pack_offset)` in the object
    /// store.
    Packed,
}

impl PackStatus {
    /// Database wire value.
    pub fn as_i64(self) -> i64 {
        match self {
            PackStatus::Unpacked => 0,
            PackStatus::Packing => 1,
            PackStatus::Packed => 2,
        }
    }

    /// Parse a database wire value.
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(PackStatus::Unpacked),
            1 => Some(PackStatus::Packing),
            2 => Some(PackStatus::Packed),
            _ => None,
        }
    }
}

/// A live row of the `blocks` table.
#[derive(Debug, Clone)]
pub struct Block {
    /// Content identifier.
    pub cid: String,
    /// Payload length in bytes.
    pub size: i64,
    /// Inline payload; present until the block is packed.
    pub data: Option<Bytes>,
    /// Name of the pack object holding the payload; empty until packed.
    pub pack_object: String,
    /// Byte offset of the payload inside the pack object.
    pub pack_offset: i64,
    /// Placement state.
    pub status: PackStatus,
}

/// A pack candidate returned by [`Blocks::list_unpacked`].
#[derive(Debug, Clone)]
pub struct UnpackedBlock {
    /// Content identifier.
    pub cid: String,
    /// Payload length in bytes.
    pub size: i64,
    /// Inline payload.
    pub data: Bytes,
}

/// The location of one block inside an uploaded pack, as recorded by
/// [`Blocks::commit_packed`].
#[derive(Debug, Clone)]
pub struct PackedBlock {
    /// Content identifier.
    pub cid: String,
    /// Pack object name.
    pub pack_object: String,
    /// Byte offset of the payload inside the pack object.
    pub pack_offset: i64,
}

/// Typed repository over the `blocks` table.
#[derive(Debug, Clone)]
pub struct Blocks {
    db: Db,
}

impl Blocks {
    /// Wrap a database handle.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new unpacked block. Fails with [`Error::Conflict`] if the
    /// CID already exists, tombstoned or not.
    pub async fn insert(&self, cid: &str, data: &[u8]) -> Result<()> {
        let sql = self.db.sql(
            "INSERT INTO blocks (cid, size, data) VALUES (?, ?, ?)
             ON CONFLICT (cid) DO NOTHING",
        );
        let result = sqlx::query(&sql)
            .bind(cid)
            .bind(data.len() as i64)
            .bind(data.to_vec())
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Conflict(format!("block {cid} already exists")));
        }
        Ok(())
    }

    /// Fetch a block row. Tombstoned rows read as absent.
    pub async fn get(&self, cid: &str) -> Result<Block> {
        let sql = self.db.sql(
            "SELECT cid, size, data, pack_object, pack_offset, pack_status
             FROM blocks WHERE cid = ? AND deleted = false",
        );
        let row = sqlx::query(&sql)
            .bind(cid)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::NotFound(cid.to_string()))?;

        let raw_status: i64 = row.get("pack_status");
        let status = PackStatus::from_i64(raw_status).ok_or_else(|| {
            Error::PermanentBackend(
                format!("block {cid} has unknown pack status {raw_status}").into(),
            )
        })?;

        Ok(Block {
            cid: row.get("cid"),
            size: row.get("size"),
            data: row.get::<Option<Vec<u8>>, _>("data").map(Bytes::from),
            pack_object: row.get("pack_object"),
            pack_offset: row.get("pack_offset"),
            status,
        })
    }

    /// Whether a live block exists for the CID.
    pub async fn has(&self, cid: &str) -> Result<bool> {
        let sql = self
            .db
            .sql("SELECT 1 AS present FROM blocks WHERE cid = ? AND deleted = false");
        let row = sqlx::query(&sql)
            .bind(cid)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Payload length without fetching the payload.
    pub async fn size_of(&self, cid: &str) -> Result<i64> {
        let sql = self
            .db
            .sql("SELECT size FROM blocks WHERE cid = ? AND deleted = false");
        let row = sqlx::query(&sql)
            .bind(cid)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| Error::NotFound(cid.to_string()))?;
        Ok(row.get("size"))
    }

    /// Tombstone a block. Idempotent; deleting an absent CID is not an
    /// error.
    pub async fn delete(&self, cid: &str) -> Result<()> {
        let sql = self.db.sql("UPDATE blocks SET deleted = true WHERE cid = ?");
        sqlx::query(&sql).bind(cid).execute(self.db.pool()).await?;
        Ok(())
    }

    /// Clear a tombstone. The store is content-addressed, so the row's
    /// payload is still the payload for that CID.
    pub async fn restore(&self, cid: &str) -> Result<()> {
        let sql = self.db.sql("UPDATE blocks SET deleted = false WHERE cid = ?");
        sqlx::query(&sql).bind(cid).execute(self.db.pool()).await?;
        Ok(())
    }

    /// List unpacked, live blocks in insertion order.
    pub async fn list_unpacked(&self, limit: i64, offset: i64) -> Result<Vec<UnpackedBlock>> {
        let sql = self.db.sql(
            "SELECT cid, size, data FROM blocks
             WHERE deleted = false AND pack_status = ?
             ORDER BY created ASC, cid ASC
             LIMIT ? OFFSET ?",
        );
        let rows = sqlx::query(&sql)
            .bind(PackStatus::Unpacked.as_i64())
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter()
            .map(|row| {
                let cid: String = row.get("cid");
                let data: Option<Vec<u8>> = row.get("data");
                let data = data.ok_or_else(|| {
                    Error::PermanentBackend(
                        format!("unpacked block {cid} has no inline data").into(),
                    )
                })?;
                Ok(UnpackedBlock {
                    cid,
                    size: row.get("size"),
                    data: Bytes::from(data),
                })
            })
            .collect()
    }

    /// Advance the listed blocks from Unpacked to Packing and return the
    /// CIDs actually claimed.
    ///
    /// The transition is guarded by `pack_status = Unpacked`, so rows
    /// already advanced (by this process or another sharing the database)
    /// are skipped silently.
    pub async fn claim_for_packing(&self, cids: &[String]) -> Result<Vec<String>> {
        if cids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; cids.len()].join(", ");
        let sql = format!(
            "UPDATE blocks SET pack_status = ?
             WHERE cid IN ({placeholders}) AND pack_status = ?
             RETURNING cid"
        );
        let sql = self.db.sql(&sql);

        let mut query = sqlx::query(&sql).bind(PackStatus::Packing.as_i64());
        for cid in cids {
            query = query.bind(cid.as_str());
        }
        let rows = query
            .bind(PackStatus::Unpacked.as_i64())
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows.iter().map(|row| row.get("cid")).collect())
    }

    /// Record the uploaded pack location for every listed block, clearing
    /// the inline payloads, in one transaction.
    ///
    /// Every listed block must currently be Packing; otherwise nothing is
    /// changed and the commit fails with [`Error::Conflict`].
    pub async fn commit_packed(&self, blocks: &[PackedBlock]) -> Result<()> {
        let sql = self.db.sql(
            "UPDATE blocks
             SET pack_status = ?, data = NULL, pack_object = ?, pack_offset = ?
             WHERE cid = ? AND pack_status = ?",
        );

        let mut tx = self.db.pool().begin().await?;
        for block in blocks {
            let result = sqlx::query(&sql)
                .bind(PackStatus::Packed.as_i64())
                .bind(block.pack_object.as_str())
                .bind(block.pack_offset)
                .bind(block.cid.as_str())
                .bind(PackStatus::Packing.as_i64())
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() != 1 {
                tx.rollback().await?;
                return Err(Error::Conflict(format!(
                    "block {} is not staged for packing",
                    block.cid
                )));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Return the listed blocks from Packing to Unpacked after a failed
    /// pack build or upload.
    pub async fn abort_packing(&self, cids: &[String]) -> Result<()> {
        if cids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; cids.len()].join(", ");
        let sql = format!(
            "UPDATE blocks SET pack_status = ?
             WHERE cid IN ({placeholders}) AND pack_status = ?"
        );
        let sql = self.db.sql(&sql);

        let mut query = sqlx::query(&sql).bind(PackStatus::Unpacked.as_i64());
        for cid in cids {
            query = query.bind(cid.as_str());
        }
        query
            .bind(PackStatus::Packing.as_i64())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Total payload bytes of all live blocks, inline or packed.
    pub async fn disk_usage(&self) -> Result<i64> {
        let sql = self.db.sql(
            "SELECT COALESCE(SUM(size), 0) AS total FROM blocks WHERE deleted = false",
        );
        let row = sqlx::query(&sql).fetch_one(self.db.pool()).await?;
        Ok(row.get("total"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> Blocks {
        let db = Db::open_memory().await.unwrap();
        db.migrate().await.unwrap();
        Blocks::new(db)
    }

    #[tokio::test]
    async fn insert_and_get() {
        let blocks = repo().await;
        blocks.insert("qm-one", b"payload").await.unwrap();

        let block = blocks.get("qm-one").await.unwrap();
        assert_eq!(block.cid, "qm-one");
        assert_eq!(block.size, 7);
        assert_eq!(block.data.as_deref(), Some(b"payload".as_slice()));
        assert_eq!(block.status, PackStatus::Unpacked);
        assert_eq!(block.pack_object, "");
        assert_eq!(block.pack_offset, 0);

        assert!(blocks.has("qm-one").await.unwrap());
        assert_eq!(blocks.size_of("qm-one").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn insert_duplicate_conflicts() {
        let blocks = repo().await;
        blocks.insert("qm-dup", b"a").await.unwrap();
        let err = blocks.insert("qm-dup", b"a").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_blocks_are_not_found() {
        let blocks = repo().await;
        assert!(!blocks.has("qm-missing").await.unwrap());
        assert!(matches!(
            blocks.get("qm-missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            blocks.size_of("qm-missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn delete_tombstones_and_is_idempotent() {
        let blocks = repo().await;
        blocks.insert("qm-del", b"bytes").await.unwrap();

        blocks.delete("qm-del").await.unwrap();
        assert!(!blocks.has("qm-del").await.unwrap());
        assert!(matches!(
            blocks.get("qm-del").await.unwrap_err(),
            Error::NotFound(_)
        ));

        // Repeating the delete, or deleting a CID that never existed,
        // is not an error.
        blocks.delete("qm-del").await.unwrap();
        blocks.delete("qm-never").await.unwrap();

        blocks.restore("qm-del").await.unwrap();
        assert!(blocks.has("qm-del").await.unwrap());
    }

    #[tokio::test]
    async fn list_unpacked_excludes_advanced_and_deleted_rows() {
        let blocks = repo().await;
        blocks.insert("block0", b"aa").await.unwrap();
        blocks.insert("block1", b"bb").await.unwrap();
        blocks.insert("block2", b"cc").await.unwrap();
        blocks.insert("block3", b"dd").await.unwrap();

        blocks.delete("block2").await.unwrap();
        let claimed = blocks
            .claim_for_packing(&["block3".to_string()])
            .await
            .unwrap();
        assert_eq!(claimed, vec!["block3".to_string()]);

        let listed = blocks.list_unpacked(10, 0).await.unwrap();
        let cids: Vec<_> = listed.iter().map(|b| b.cid.as_str()).collect();
        assert_eq!(cids, vec!["block0", "block1"]);
        assert_eq!(listed[0].data.as_ref(), b"aa");

        // Paging.
        let page = blocks.list_unpacked(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].cid, "block1");
    }

    #[tokio::test]
    async fn claim_skips_rows_already_advanced() {
        let blocks = repo().await;
        blocks.insert("block0", b"aa").await.unwrap();
        blocks.insert("block1", b"bb").await.unwrap();

        let first = blocks
            .claim_for_packing(&["block0".to_string(), "block1".to_string()])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        // A second claim finds nothing left in Unpacked.
        let second = blocks
            .claim_for_packing(&["block0".to_string(), "block1".to_string()])
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn commit_packed_flips_rows_and_clears_data() {
        let blocks = repo().await;
        blocks.insert("block0", b"aa").await.unwrap();
        blocks.insert("block1", b"bb").await.unwrap();
        blocks
            .claim_for_packing(&["block0".to_string(), "block1".to_string()])
            .await
            .unwrap();

        blocks
            .commit_packed(&[
                PackedBlock {
                    cid: "block0".to_string(),
                    pack_object: "deadbeef.zip".to_string(),
                    pack_offset: 42,
                },
                PackedBlock {
                    cid: "block1".to_string(),
                    pack_object: "deadbeef.zip".to_string(),
                    pack_offset: 96,
                },
            ])
            .await
            .unwrap();

        let block = blocks.get("block1").await.unwrap();
        assert_eq!(block.status, PackStatus::Packed);
        assert!(block.data.is_none());
        assert_eq!(block.pack_object, "deadbeef.zip");
        assert_eq!(block.pack_offset, 96);
    }

    #[tokio::test]
    async fn commit_packed_aborts_wholesale_on_unstaged_row() {
        let blocks = repo().await;
        blocks.insert("block0", b"aa").await.unwrap();
        blocks.insert("block1", b"bb").await.unwrap();
        blocks
            .claim_for_packing(&["block0".to_string()])
            .await
            .unwrap();

        // block1 was never claimed, so the whole commit must roll back.
        let err = blocks
            .commit_packed(&[
                PackedBlock {
                    cid: "block0".to_string(),
                    pack_object: "cafe.zip".to_string(),
                    pack_offset: 30,
                },
                PackedBlock {
                    cid: "block1".to_string(),
                    pack_object: "cafe.zip".to_string(),
                    pack_offset: 60,
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let block = blocks.get("block0").await.unwrap();
        assert_eq!(block.status, PackStatus::Packing);
        assert_eq!(block.pack_object, "");
        assert!(block.data.is_some());
    }

    #[tokio::test]
    async fn abort_packing_reverses_only_claimed_rows() {
        let blocks = repo().await;
        blocks.insert("block0", b"aa").await.unwrap();
        blocks.insert("block1", b"bb").await.unwrap();
        blocks
            .claim_for_packing(&["block0".to_string()])
            .await
            .unwrap();

        blocks
            .abort_packing(&["block0".to_string(), "block1".to_string()])
            .await
            .unwrap();

        assert_eq!(
            blocks.get("block0").await.unwrap().status,
            PackStatus::Unpacked
        );
        assert_eq!(
            blocks.get("block1").await.unwrap().status,
            PackStatus::Unpacked
        );

        // Both rows are candidates again.
        assert_eq!(blocks.list_unpacked(10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disk_usage_sums_live_blocks() {
        let blocks = repo().await;
        assert_eq!(blocks.disk_usage().await.unwrap(), 0);

        blocks.insert("block0", &[0u8; 100]).await.unwrap();
        blocks.insert("block1", &[0u8; 28]).await.unwrap();
        assert_eq!(blocks.disk_usage().await.unwrap(), 128);

        blocks.delete("block1").await.unwrap();
        assert_eq!(blocks.disk_usage().await.unwrap(), 100);
    }
}
