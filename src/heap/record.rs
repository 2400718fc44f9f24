//! Record codec
//!
//! A record is the payload of one occupied slot:
//!
//! ```text
//! ┌────────────┬──────────┬──────────┬──────────────────────────────────┐
//! │BodyLen (4) │ CRC (4)  │ Meta (1) │ Body                             │
//! └────────────┴──────────┴──────────┴──────────────────────────────────┘
//! Body (KPD):  [KeyLen (4)][Key]   if KEY_STORED
//!              [Value]             unless TOMBSTONE
//! ```
//!
//! The CRC covers the meta byte and the body.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FlatError, Result};
use crate::hash::content_hash;

/// BodyLen (4) + CRC (4) + Meta (1)
pub const RECORD_HEADER_SIZE: usize = 9;

/// Metadata byte of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// Record is a persisted "known absent" marker
    pub const TOMBSTONE: u8 = 0x01;

    /// Key bytes are stored verbatim (otherwise derived from the value)
    pub const KEY_STORED: u8 = 0x02;

    const KNOWN: u8 = Self::TOMBSTONE | Self::KEY_STORED;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_tombstone(self) -> bool {
        self.0 & Self::TOMBSTONE != 0
    }

    pub fn key_stored(self) -> bool {
        self.0 & Self::KEY_STORED != 0
    }

    fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(FlatError::Corruption(format!(
                "unknown record flags 0x{:02x}",
                bits
            )));
        }
        let flags = Self(bits);
        if flags.is_tombstone() && !flags.key_stored() {
            return Err(FlatError::Corruption(
                "tombstone record without stored key".into(),
            ));
        }
        Ok(flags)
    }
}

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub flags: RecordFlags,
    /// Present when `KEY_STORED`
    pub key: Option<Vec<u8>>,
    /// Absent for tombstones
    pub value: Option<Vec<u8>>,
}

impl Record {
    /// A value record; the key is stored only when asked to
    pub fn value(key: &[u8], value: &[u8], store_key: bool) -> Self {
        let (flags, key) = if store_key {
            (RecordFlags(RecordFlags::KEY_STORED), Some(key.to_vec()))
        } else {
            (RecordFlags(0), None)
        };
        Self {
            flags,
            key,
            value: Some(value.to_vec()),
        }
    }

    /// A tombstone record for `key`
    pub fn tombstone(key: &[u8]) -> Self {
        Self {
            flags: RecordFlags(RecordFlags::TOMBSTONE | RecordFlags::KEY_STORED),
            key: Some(key.to_vec()),
            value: None,
        }
    }

    /// The record's key: stored bytes, or the content hash of the value
    pub fn key(&self) -> Vec<u8> {
        match (&self.key, &self.value) {
            (Some(key), _) => key.clone(),
            (None, Some(value)) => content_hash(value).to_vec(),
            (None, None) => Vec::new(),
        }
    }

    /// Compare against a lookup key without allocating when the key is stored
    pub fn matches_key(&self, key: &[u8]) -> bool {
        match (&self.key, &self.value) {
            (Some(stored), _) => stored.as_slice() == key,
            (None, Some(value)) => content_hash(value).as_slice() == key,
            (None, None) => false,
        }
    }

    fn body_len(&self) -> usize {
        let key_part = self.key.as_ref().map_or(0, |k| 4 + k.len());
        let value_part = self.value.as_ref().map_or(0, Vec::len);
        key_part + value_part
    }

    /// Total encoded size in the data region
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body_len()
    }

    /// Encode header and body
    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(1 + self.body_len());
        body.put_u8(self.flags.bits());
        if let Some(key) = &self.key {
            body.put_u32_le(key.len() as u32);
            body.put_slice(key);
        }
        if let Some(value) = &self.value {
            body.put_slice(value);
        }
        let crc = crc32fast::hash(&body);

        let mut out = BytesMut::with_capacity(self.encoded_len());
        out.put_u32_le(self.body_len() as u32);
        out.put_u32_le(crc);
        out.put_slice(&body);
        out
    }

    /// Split a header into (body length, crc)
    pub fn decode_header(header: &[u8]) -> Result<(usize, u32)> {
        if header.len() < RECORD_HEADER_SIZE {
            return Err(FlatError::Corruption(format!(
                "record header truncated: {} bytes",
                header.len()
            )));
        }
        let mut buf = header;
        let body_len = buf.get_u32_le() as usize;
        let crc = buf.get_u32_le();
        Ok((body_len, crc))
    }

    /// Decode a full record (header included) and verify its checksum
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (body_len, crc) = Self::decode_header(bytes)?;
        let checked = &bytes[8..];
        if checked.len() != 1 + body_len {
            return Err(FlatError::Corruption(format!(
                "record length mismatch: header says {}, have {}",
                body_len,
                checked.len().saturating_sub(1)
            )));
        }
        let actual = crc32fast::hash(checked);
        if actual != crc {
            return Err(FlatError::Corruption(format!(
                "record CRC mismatch: expected 0x{:08x}, got 0x{:08x}",
                crc, actual
            )));
        }

        let mut buf = checked;
        let flags = RecordFlags::from_bits(buf.get_u8())?;
        let key = if flags.key_stored() {
            if buf.remaining() < 4 {
                return Err(FlatError::Corruption("record key length truncated".into()));
            }
            let key_len = buf.get_u32_le() as usize;
            if buf.remaining() < key_len {
                return Err(FlatError::Corruption(format!(
                    "record key of {} bytes exceeds body",
                    key_len
                )));
            }
            let key = buf[..key_len].to_vec();
            buf.advance(key_len);
            Some(key)
        } else {
            None
        };

        let value = if flags.is_tombstone() {
            if buf.has_remaining() {
                return Err(FlatError::Corruption("tombstone record carries a value".into()));
            }
            None
        } else {
            Some(buf.to_vec())
        };

        Ok(Self { flags, key, value })
    }
}
