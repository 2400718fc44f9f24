//! Crash log entry definitions
//!
//! Defines the structure and framing of individual undo entries.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::heap::{SlotField, SlotIndex};

/// Len (4) + CRC (4)
pub const FRAME_HEADER_SIZE: usize = 8;

/// A single entry in the crash log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 0
    pub seq: u64,

    pub op: LogOp,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// First entry of every log
    Begin { batch: u64 },

    /// A slot word is about to be overwritten; `previous` restores it
    SlotWrite {
        slot: SlotIndex,
        field: SlotField,
        previous: u64,
    },
}

/// Outcome of decoding one frame
#[derive(Debug)]
pub enum Frame {
    /// A verified entry and the number of bytes it occupied
    Entry(LogEntry, usize),

    /// The buffer ends inside this frame
    Torn,

    /// Checksum or payload of a frame of `len` bytes is invalid
    Invalid { len: usize },
}

impl LogEntry {
    pub fn new(seq: u64, op: LogOp) -> Self {
        Self { seq, op }
    }

    /// Frame: Len (4) | CRC (4) | bincode payload
    pub fn encode(&self) -> Result<BytesMut> {
        let payload = bincode::serialize(self)?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(crc32fast::hash(&payload));
        frame.put_slice(&payload);
        Ok(frame)
    }

    /// Decode the frame at the start of `buf`
    pub fn decode(buf: &[u8]) -> Frame {
        if buf.len() < FRAME_HEADER_SIZE {
            return Frame::Torn;
        }
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let crc = header.get_u32_le();

        let total = FRAME_HEADER_SIZE + len;
        if buf.len() < total {
            return Frame::Torn;
        }
        let payload = &buf[FRAME_HEADER_SIZE..total];
        if crc32fast::hash(payload) != crc {
            return Frame::Invalid { len: total };
        }
        match bincode::deserialize(payload) {
            Ok(entry) => Frame::Entry(entry, total),
            Err(_) => Frame::Invalid { len: total },
        }
    }
}
