//! Heap description
//!
//! Persisted summary of a heap: format flags, geometry and element count.
//!
//! ```text
//! ┌─────────────┬─────────┬───────────────────────┐
//! │ Version (4) │ CRC (4) │ bincode(description)  │
//! └─────────────┴─────────┴───────────────────────┘
//! ```
//! Version 1 predates format flags and page sizes.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::aux_store::AuxStore;
use crate::backend::Backend;
use crate::error::{FlatError, Result};

/// Description file name (unless kept in the aux store)
pub const DESCRIPTION_FILENAME: &str = "heap.desc";

/// Aux store key of the description
pub const DESCRIPTION_KEY: &[u8] = b"heap.description";

/// Current description version
pub const DESCRIPTION_VERSION: u32 = 2;

const LEGACY_VERSION: u32 = 1;

/// Current description layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDescription {
    pub format_bits: u32,
    pub slot_capacity: u64,
    pub data_capacity: u64,
    pub page_size: u32,
    pub elements: u64,
}

/// Version 1 layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyDescription {
    pub slot_capacity: u64,
    pub data_capacity: u64,
    pub elements: u64,
}

/// A description as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredDescription {
    Current(HeapDescription),
    Legacy(LegacyDescription),
}

impl HeapDescription {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(frame(DESCRIPTION_VERSION, &bincode::serialize(self)?))
    }
}

impl LegacyDescription {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(frame(LEGACY_VERSION, &bincode::serialize(self)?))
    }
}

impl StoredDescription {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(FlatError::Corruption("heap description truncated".into()));
        }
        let mut header = &bytes[..8];
        let version = header.get_u32_le();
        let crc = header.get_u32_le();
        let body = &bytes[8..];
        if crc32fast::hash(body) != crc {
            return Err(FlatError::Corruption(
                "heap description fails its checksum".into(),
            ));
        }

        match version {
            DESCRIPTION_VERSION => Ok(StoredDescription::Current(bincode::deserialize(body)?)),
            LEGACY_VERSION => Ok(StoredDescription::Legacy(bincode::deserialize(body)?)),
            other => Err(FlatError::Config(format!(
                "unknown heap description version {}",
                other
            ))),
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            StoredDescription::Current(_) => DESCRIPTION_VERSION,
            StoredDescription::Legacy(_) => LEGACY_VERSION,
        }
    }
}

fn frame(version: u32, body: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_u32_le(version);
    out.put_u32_le(crc32fast::hash(body));
    out.put_slice(body);
    out.to_vec()
}

/// Where descriptions are kept
pub enum DescriptionSink {
    File(PathBuf),
    Aux(Arc<AuxStore>),
}

impl DescriptionSink {
    pub fn load(&self) -> Result<Option<StoredDescription>> {
        let bytes = match self {
            DescriptionSink::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                fs::read(path)?
            }
            DescriptionSink::Aux(aux) => match aux.get(DESCRIPTION_KEY)? {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
        };
        StoredDescription::decode(&bytes).map(Some)
    }

    pub fn store(&self, description: &HeapDescription) -> Result<()> {
        self.store_bytes(&description.encode()?)
    }

    pub fn store_bytes(&self, bytes: &[u8]) -> Result<()> {
        match self {
            DescriptionSink::File(path) => {
                let tmp = path.with_extension("desc.tmp");
                let mut file = File::create(&tmp)?;
                file.write_all(bytes)?;
                file.sync_all()?;
                fs::rename(&tmp, path)?;
                Ok(())
            }
            DescriptionSink::Aux(aux) => {
                aux.put(DESCRIPTION_KEY, bytes)?;
                aux.flush()
            }
        }
    }
}
