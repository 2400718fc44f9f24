//! Auxiliary store
//!
//! Small persistent map for data that does not belong in the heap: heap
//! descriptions and pairs whose key is not the content hash of the value.
//!
//! ## File Format
//! ```text
//! ┌───────────┬─────────┬─────────┬──────────────────────────┐
//! │ Magic (8) │ CRC (4) │ Len (8) │ bincode(BTreeMap)        │
//! └───────────┴─────────┴─────────┴──────────────────────────┘
//! ```
//! Rewritten whole on flush through a temp file and a rename.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;

use crate::backend::{Backend, WriteBatch};
use crate::error::{FlatError, Result};

/// Snapshot file name
pub const AUX_FILENAME: &str = "aux.kv";

const AUX_MAGIC: &[u8; 8] = b"FLATAUX\0";
const AUX_HEADER_SIZE: usize = 20;

/// Persistent `BTreeMap` snapshot
pub struct AuxStore {
    path: PathBuf,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    read_only: bool,

    /// Changed since the last flush
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl AuxStore {
    /// Load `aux.kv` from `dir`, or start empty
    pub fn open(dir: &Path, read_only: bool) -> Result<Self> {
        let path = dir.join(AUX_FILENAME);
        let map = if path.exists() {
            Self::load(&path)?
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), entries = map.len(), "Opened aux store");

        Ok(Self {
            path,
            map: RwLock::new(map),
            read_only,
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    fn load(path: &Path) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let data = fs::read(path)?;
        if data.len() < AUX_HEADER_SIZE || &data[..8] != AUX_MAGIC {
            return Err(FlatError::Corruption(format!(
                "{} is not an aux store snapshot",
                path.display()
            )));
        }
        let mut header = &data[8..AUX_HEADER_SIZE];
        let crc = header.get_u32_le();
        let len = header.get_u64_le() as usize;

        let payload = &data[AUX_HEADER_SIZE..];
        if payload.len() != len || crc32fast::hash(payload) != crc {
            return Err(FlatError::Corruption(format!(
                "aux store snapshot {} fails its checksum",
                path.display()
            )));
        }
        Ok(bincode::deserialize(payload)?)
    }

    fn persist(&self, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<()> {
        let payload = bincode::serialize(map)?;
        let mut out = BytesMut::with_capacity(AUX_HEADER_SIZE + payload.len());
        out.put_slice(AUX_MAGIC);
        out.put_u32_le(crc32fast::hash(&payload));
        out.put_u64_le(payload.len() as u64);
        out.put_slice(&payload);

        let tmp = self.path.with_extension("kv.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&out)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(FlatError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            Err(FlatError::ReadOnlyViolation)
        } else {
            Ok(())
        }
    }
}

impl Backend for AuxStore {
    fn name(&self) -> &str {
        "aux"
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(FlatError::InvalidKey);
        }
        self.map.write().insert(key.to_vec(), value.to_vec());
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn update_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.check_writable()?;
        batch.validate()?;
        if batch.is_empty() {
            return Ok(());
        }
        let mut map = self.map.write();
        for (key, value) in &batch.writes {
            if !batch.removals.contains(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        for key in &batch.removals {
            map.remove(key);
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn keys(&self) -> Result<BTreeSet<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.map.read().keys().cloned().collect())
    }

    fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only || !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        // Hold the write lock so no update lands between snapshot and clean mark
        let map = self.map.write();
        self.persist(&map)?;
        self.dirty.store(false, Ordering::Release);
        tracing::debug!(entries = map.len(), "Flushed aux store");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn power_failure(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
