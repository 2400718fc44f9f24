//! Cache snapshot
//!
//! What the cache layer keeps across restarts: the committed tier (only when
//! `cache_snapshot` is on) and the keys deleted from a base store that cannot
//! record removals.
//!
//! ## File Format
//! ```text
//! ┌───────────┬─────────┬─────────┬──────────────────────────┐
//! │ Magic (8) │ CRC (4) │ Len (8) │ bincode(CacheSnapshot)   │
//! └───────────┴─────────┴─────────┴──────────────────────────┘
//! ```
//! Replaced whole through a temp file and a rename.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::CacheEntry;
use crate::error::{FlatError, Result};

/// Snapshot file name
pub const SNAPSHOT_FILENAME: &str = "cache.snap";

const SNAPSHOT_MAGIC: &[u8; 8] = b"FLATSNP\0";
const SNAPSHOT_HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Committed tier, least recently used first
    pub committed: Vec<(Vec<u8>, CacheEntry)>,

    /// Deleted keys the base store still holds
    pub removed: BTreeSet<Vec<u8>>,
}

impl CacheSnapshot {
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty() && self.removed.is_empty()
    }

    /// Read the snapshot at `path`, `None` when there is none
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        if data.len() < SNAPSHOT_HEADER_SIZE || &data[..8] != SNAPSHOT_MAGIC {
            return Err(FlatError::Corruption(format!(
                "{} is not a cache snapshot",
                path.display()
            )));
        }
        let mut header = &data[8..SNAPSHOT_HEADER_SIZE];
        let crc = header.get_u32_le();
        let len = header.get_u64_le() as usize;

        let payload = &data[SNAPSHOT_HEADER_SIZE..];
        if payload.len() != len || crc32fast::hash(payload) != crc {
            return Err(FlatError::Corruption(format!(
                "cache snapshot {} fails its checksum",
                path.display()
            )));
        }
        Ok(Some(bincode::deserialize(payload)?))
    }

    /// Write the snapshot to `path`; an empty snapshot deletes the file
    pub fn store(&self, path: &Path) -> Result<()> {
        if self.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }

        let payload = bincode::serialize(self)?;
        let mut out = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + payload.len());
        out.put_slice(SNAPSHOT_MAGIC);
        out.put_u32_le(crc32fast::hash(&payload));
        out.put_u64_le(payload.len() as u64);
        out.put_slice(&payload);

        let tmp = path.with_extension("snap.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&out)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
