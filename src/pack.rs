//! Pack archive construction.
//!
//! A pack is a ZIP archive holding many small blocks: one `Stored`
//! (uncompressed) entry per block, entry name = CID, entry payload = the
//! block bytes. The offset recorded for each block points at the entry
//! payload inside the archive, not the local file header, so a reader can
//! fetch `[offset, offset + size)` with a single ranged download and never
//! parse the archive.

use std::collections::HashMap;
use std::io::{Cursor, Write};

use bytes::Bytes;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::blocks::UnpackedBlock;
use crate::error::{Error, Result};

/// Build a single pack blob out of an ordered batch of blocks.
///
/// Returns the finished archive and a map from CID to the byte offset of
/// that block's payload within the archive.
pub fn build_pack(blocks: &[UnpackedBlock]) -> Result<(Bytes, HashMap<String, u64>)> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    for block in blocks {
        writer.start_file(block.cid.as_str(), options)?;
        writer.write_all(&block.data)?;
    }
    let blob = writer.finish()?.into_inner();

    // The writer does not expose payload positions, so read the directory
    // back and take each entry's data start as the authoritative offset.
    let mut offsets = HashMap::with_capacity(blocks.len());
    let mut archive = ZipArchive::new(Cursor::new(&blob))?;
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        offsets.insert(entry.name().to_string(), entry.data_start());
    }

    for block in blocks {
        if !offsets.contains_key(&block.cid) {
            return Err(Error::PermanentBackend(
                format!("pack archive is missing an entry for {}", block.cid).into(),
            ));
        }
    }

    Ok((Bytes::from(blob), offsets))
}
