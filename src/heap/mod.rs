//! Heap Module
//!
//! Fixed-capacity, file-backed storage for records, addressed by typed
//! offsets. Never resized after creation.
//!
//! ## Responsibilities
//! - Slot table: one `(record, next)` word pair per slot
//! - Record region: append-only byte region holding KPD records
//! - Bounds-checked access; out-of-range positions are `Corruption`
//!
//! ## File Format
//! ```text
//! heap.idx                                   heap.dat
//! ┌──────────────────────────────┐           ┌──────────────────────────────┐
//! │ Header page                  │           │ Header page                  │
//! │ Magic|Ver|PageSize|Slots     │           │ Magic|Ver|PageSize|Bytes     │
//! ├──────────────────────────────┤           ├──────────────────────────────┤
//! │ Slot 0: record (8) | next (8)│──────┐    │ Record @0                    │
//! │ Slot 1: record (8) | next (8)│      └───▶│ Record @n                    │
//! │ ...                          │           │ ...          ◀── data_end    │
//! └──────────────────────────────┘           └──────────────────────────────┘
//! ```
//!
//! `record` = 0 (available), `u64::MAX` (removed) or offset + 1.
//! `next` = 0 (end of chain) or slot + 1.

mod allocator;
mod offset;
mod record;

pub use allocator::{HeapAllocator, HeapGeometry, HeapWriter};
pub use offset::{RecordOffset, SlotField, SlotIndex, SlotState};
pub use record::{Record, RecordFlags, RECORD_HEADER_SIZE};

/// Slot table file name
pub const INDEX_FILENAME: &str = "heap.idx";

/// Record region file name
pub const DATA_FILENAME: &str = "heap.dat";

/// Two little-endian u64 words per slot
pub const SLOT_SIZE: u64 = 16;

const INDEX_MAGIC: &[u8; 8] = b"FLATIDX\0";
const DATA_MAGIC: &[u8; 8] = b"FLATDAT\0";

/// Version of the heap file headers
const FORMAT_VERSION: u16 = 1;
