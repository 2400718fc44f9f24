//! Heap Allocator
//!
//! Fixed-capacity, file-backed slot table and record region.
//!
//! ## Concurrency
//! - Reads (`slot_state`, `next_slot`, `read_record`) take `&self` and may run
//!   concurrently with one writer.
//! - Mutations require the unique `HeapWriter` handed out when the heap is
//!   created or opened, so writers are serialized by whoever owns that handle.
//! - Slot words are atomics: record bytes are written and `data_end` advanced
//!   before a slot ever points at them, and published record bytes are never
//!   rewritten while the heap is open.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, BytesMut};
use memmap2::{MmapOptions, MmapRaw};

use crate::error::{FlatError, Result};

use super::offset::{RecordOffset, SlotField, SlotIndex, SlotState};
use super::record::{Record, RECORD_HEADER_SIZE};
use super::{DATA_FILENAME, DATA_MAGIC, FORMAT_VERSION, INDEX_FILENAME, INDEX_MAGIC, SLOT_SIZE};

/// Shape of a heap, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapGeometry {
    /// Number of slots
    pub slot_capacity: u64,
    /// Bytes available for records
    pub data_capacity: u64,
    /// Header size and file size granularity
    pub page_size: u64,
}

/// Exclusive right to mutate one heap
///
/// Exactly one exists per open `HeapAllocator`.
#[derive(Debug)]
pub struct HeapWriter {
    _private: (),
}

/// Memory-mapped slot table + record region
pub struct HeapAllocator {
    /// Directory holding `heap.idx` / `heap.dat`
    dir: PathBuf,

    /// Slot table mapping (header page + slots)
    index_map: MmapRaw,

    /// Record region mapping (header page + records)
    data_map: MmapRaw,

    geometry: HeapGeometry,

    /// First unused byte of the record region
    data_end: AtomicU64,

    // Keep the descriptors alive for the lifetime of the mappings
    _index_file: File,
    _data_file: File,
}

impl HeapAllocator {
    /// Whether a heap exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILENAME).exists() && dir.join(DATA_FILENAME).exists()
    }

    /// Create a new heap, truncating any existing files
    pub fn create(dir: &Path, geometry: HeapGeometry) -> Result<(Self, HeapWriter)> {
        if geometry.slot_capacity == 0 || geometry.data_capacity == 0 {
            return Err(FlatError::Config("heap geometry must be non-empty".into()));
        }

        let page = geometry.page_size;
        let table_bytes = (geometry.slot_capacity * SLOT_SIZE).div_ceil(page) * page;
        let data_bytes = geometry.data_capacity.div_ceil(page) * page;

        let index_file = Self::create_file(&dir.join(INDEX_FILENAME), page + table_bytes)?;
        let data_file = Self::create_file(&dir.join(DATA_FILENAME), page + data_bytes)?;

        let index_map = MmapOptions::new().map_raw(&index_file)?;
        let data_map = MmapOptions::new().map_raw(&data_file)?;

        let heap = Self {
            dir: dir.to_path_buf(),
            index_map,
            data_map,
            geometry,
            data_end: AtomicU64::new(0),
            _index_file: index_file,
            _data_file: data_file,
        };

        // Slots are zero (available) thanks to set_len; only headers need writing
        heap.write_header(&heap.index_map, INDEX_MAGIC, geometry.slot_capacity)?;
        heap.write_header(&heap.data_map, DATA_MAGIC, geometry.data_capacity)?;
        heap.sync()?;

        tracing::info!(
            slots = geometry.slot_capacity,
            data_bytes = geometry.data_capacity,
            page_size = geometry.page_size,
            path = %dir.display(),
            "Created heap"
        );

        let writer = heap.new_writer();
        Ok((heap, writer))
    }

    /// Open an existing heap and validate both headers
    ///
    /// `data_end` starts at zero; call `rebuild` once recovery is done.
    pub fn open(dir: &Path) -> Result<(Self, HeapWriter)> {
        let index_file = Self::open_file(&dir.join(INDEX_FILENAME))?;
        let data_file = Self::open_file(&dir.join(DATA_FILENAME))?;

        let index_map = MmapOptions::new().map_raw(&index_file)?;
        let data_map = MmapOptions::new().map_raw(&data_file)?;

        let (index_page, slot_capacity) = Self::read_header(&index_map, INDEX_MAGIC, "index")?;
        let (data_page, data_capacity) = Self::read_header(&data_map, DATA_MAGIC, "data")?;

        if index_page != data_page {
            return Err(FlatError::Corruption(format!(
                "page size mismatch between index ({}) and data ({}) files",
                index_page, data_page
            )));
        }
        if (index_map.len() as u64) < index_page + slot_capacity * SLOT_SIZE {
            return Err(FlatError::Corruption(format!(
                "index file truncated: {} bytes for {} slots",
                index_map.len(),
                slot_capacity
            )));
        }
        if (data_map.len() as u64) < data_page + data_capacity {
            return Err(FlatError::Corruption(format!(
                "data file truncated: {} bytes for a {} byte region",
                data_map.len(),
                data_capacity
            )));
        }

        let heap = Self {
            dir: dir.to_path_buf(),
            index_map,
            data_map,
            geometry: HeapGeometry {
                slot_capacity,
                data_capacity,
                page_size: index_page,
            },
            data_end: AtomicU64::new(0),
            _index_file: index_file,
            _data_file: data_file,
        };

        tracing::info!(
            slots = slot_capacity,
            data_bytes = data_capacity,
            path = %dir.display(),
            "Opened heap"
        );

        let writer = heap.new_writer();
        Ok((heap, writer))
    }

    // =========================================================================
    // Slot Table
    // =========================================================================

    /// Decoded `record` word of a slot
    pub fn slot_state(&self, slot: SlotIndex) -> Result<SlotState> {
        let state = SlotState::from_word(self.slot_word(slot, SlotField::Record)?);
        if let SlotState::Occupied(offset) = state {
            if offset.get() >= self.geometry.data_capacity {
                return Err(FlatError::Corruption(format!(
                    "{} points outside the data region ({})",
                    slot, offset
                )));
            }
        }
        Ok(state)
    }

    /// Next slot of the chain through `slot`
    pub fn next_slot(&self, slot: SlotIndex) -> Result<Option<SlotIndex>> {
        match SlotIndex::from_link(self.slot_word(slot, SlotField::Next)?) {
            Some(next) if next.get() >= self.geometry.slot_capacity => {
                Err(FlatError::Corruption(format!(
                    "{} links to {} beyond capacity {}",
                    slot, next, self.geometry.slot_capacity
                )))
            }
            link => Ok(link),
        }
    }

    /// Raw word of a slot
    pub fn slot_word(&self, slot: SlotIndex, field: SlotField) -> Result<u64> {
        Ok(self.slot_atomic(slot, field)?.load(Ordering::Acquire))
    }

    /// Overwrite a slot word (publication point for readers)
    pub fn store_slot_word(
        &self,
        writer: &mut HeapWriter,
        slot: SlotIndex,
        field: SlotField,
        word: u64,
    ) -> Result<()> {
        let _ = writer;
        self.slot_atomic(slot, field)?.store(word, Ordering::Release);
        Ok(())
    }

    fn slot_atomic(&self, slot: SlotIndex, field: SlotField) -> Result<&AtomicU64> {
        if slot.get() >= self.geometry.slot_capacity {
            return Err(FlatError::Corruption(format!(
                "{} out of bounds (capacity {})",
                slot, self.geometry.slot_capacity
            )));
        }
        let pos = (self.geometry.page_size
            + slot.get() * SLOT_SIZE
            + (field.word_index() as u64) * 8) as usize;
        check_mapped(&self.index_map, pos, 8)?;
        if pos % 8 != 0 {
            return Err(FlatError::Corruption(format!("{} is not word aligned", slot)));
        }
        // SAFETY: 8 in-bounds, aligned bytes; every access to them is atomic.
        Ok(unsafe { &*(self.index_map.as_mut_ptr().add(pos) as *const AtomicU64) })
    }

    // =========================================================================
    // Record Region
    // =========================================================================

    /// Append a record at `data_end`
    ///
    /// The bytes are complete before this returns; no slot points at them yet.
    pub fn append_record(&self, writer: &mut HeapWriter, record: &Record) -> Result<RecordOffset> {
        let _ = writer;
        let bytes = record.encode();
        let start = self.data_end.load(Ordering::Acquire);
        let end = start + bytes.len() as u64;
        if end > self.geometry.data_capacity {
            return Err(FlatError::heap_full(format!(
                "record of {} bytes does not fit ({} of {} bytes used)",
                bytes.len(),
                start,
                self.geometry.data_capacity
            )));
        }

        // Beyond `data_end`, so no reader holds an offset into these bytes
        copy_to_map(&self.data_map, (self.geometry.page_size + start) as usize, &bytes)?;
        self.data_end.store(end, Ordering::Release);
        Ok(RecordOffset::new(start))
    }

    /// Read and verify the record at `offset`
    pub fn read_record(&self, offset: RecordOffset) -> Result<Record> {
        let (body_len, _) = Record::decode_header(&self.read_bytes(offset, RECORD_HEADER_SIZE)?)?;
        let bytes = self.read_bytes(offset, RECORD_HEADER_SIZE + body_len)?;
        Record::decode(&bytes)
    }

    /// Encoded size of the record at `offset`
    pub fn record_len(&self, offset: RecordOffset) -> Result<u64> {
        let (body_len, _) = Record::decode_header(&self.read_bytes(offset, RECORD_HEADER_SIZE)?)?;
        Ok((RECORD_HEADER_SIZE + body_len) as u64)
    }

    fn read_bytes(&self, offset: RecordOffset, len: usize) -> Result<Vec<u8>> {
        let end = offset.get().checked_add(len as u64);
        let limit = self.data_end.load(Ordering::Acquire);
        match end {
            Some(end) if end <= limit => {}
            _ => {
                return Err(FlatError::Corruption(format!(
                    "record {} (+{} bytes) beyond data end {}",
                    offset, len, limit
                )))
            }
        }

        // Published bytes below `data_end` are never rewritten while open
        let mut out = vec![0u8; len];
        copy_from_map(&self.data_map, (self.geometry.page_size + offset.get()) as usize, &mut out)?;
        Ok(out)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Rebuild `data_end` from the slot table
    ///
    /// Returns the number of occupied slots. Records no slot points at (left
    /// behind by interrupted writes) are reclaimed.
    pub fn rebuild(&self, writer: &mut HeapWriter) -> Result<u64> {
        let _ = writer;
        // Headers must be readable during the scan
        self.data_end.store(self.geometry.data_capacity, Ordering::Release);

        let mut end = 0u64;
        let mut occupied = 0u64;
        for i in 0..self.geometry.slot_capacity {
            if let SlotState::Occupied(offset) = self.slot_state(SlotIndex::new(i))? {
                let record_end = offset.get() + self.record_len(offset)?;
                if record_end > self.geometry.data_capacity {
                    return Err(FlatError::Corruption(format!(
                        "record {} overruns the data region",
                        offset
                    )));
                }
                end = end.max(record_end);
                occupied += 1;
            }
        }

        self.data_end.store(end, Ordering::Release);
        tracing::debug!(occupied, data_end = end, "Rebuilt heap occupancy");
        Ok(occupied)
    }

    /// Flush both mappings to disk
    pub fn sync(&self) -> Result<()> {
        self.index_map.flush()?;
        self.data_map.flush()?;
        Ok(())
    }

    pub fn geometry(&self) -> HeapGeometry {
        self.geometry
    }

    pub fn slot_capacity(&self) -> u64 {
        self.geometry.slot_capacity
    }

    pub fn data_capacity(&self) -> u64 {
        self.geometry.data_capacity
    }

    /// Bytes of the record region in use
    pub fn data_used(&self) -> u64 {
        self.data_end.load(Ordering::Acquire)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn new_writer(&self) -> HeapWriter {
        HeapWriter { _private: () }
    }

    fn create_file(path: &Path, len: u64) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(file)
    }

    fn open_file(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(path)?)
    }

    /// Header: Magic (8) | Version (2) | PageSize (4) | Capacity (8)
    fn write_header(&self, map: &MmapRaw, magic: &[u8; 8], capacity: u64) -> Result<()> {
        let mut header = BytesMut::with_capacity(22);
        header.put_slice(magic);
        header.put_u16_le(FORMAT_VERSION);
        header.put_u32_le(self.geometry.page_size as u32);
        header.put_u64_le(capacity);
        copy_to_map(map, 0, &header)
    }

    fn read_header(map: &MmapRaw, magic: &[u8; 8], what: &str) -> Result<(u64, u64)> {
        if map.len() < 22 {
            return Err(FlatError::Corruption(format!("{} file too small", what)));
        }
        let mut header = [0u8; 22];
        copy_from_map(map, 0, &mut header)?;

        if &header[0..8] != magic {
            return Err(FlatError::Corruption(format!(
                "invalid {} file magic: {:?}",
                what,
                &header[0..8]
            )));
        }
        let mut buf = &header[8..];
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(FlatError::Corruption(format!(
                "unsupported {} file version {}",
                what, version
            )));
        }
        let page_size = u64::from(buf.get_u32_le());
        if page_size != 4096 && page_size != 16384 {
            return Err(FlatError::Corruption(format!(
                "invalid page size {} in {} file",
                page_size, what
            )));
        }
        let capacity = buf.get_u64_le();
        if capacity == 0 {
            return Err(FlatError::Corruption(format!("{} file has zero capacity", what)));
        }
        Ok((page_size, capacity))
    }
}

// =============================================================================
// Mapped Byte Access
// =============================================================================
//
// The only places that touch mapped bytes outside slot words. Each checks its
// range against the mapping first. Callers uphold the rest: writes target
// bytes no reader can reach yet and come from the `HeapWriter` holder.

fn check_mapped(map: &MmapRaw, pos: usize, len: usize) -> Result<()> {
    match pos.checked_add(len) {
        Some(end) if end <= map.len() => Ok(()),
        _ => Err(FlatError::Corruption(format!(
            "mapped range {}+{} beyond mapping of {} bytes",
            pos,
            len,
            map.len()
        ))),
    }
}

fn copy_to_map(map: &MmapRaw, pos: usize, bytes: &[u8]) -> Result<()> {
    check_mapped(map, pos, bytes.len())?;
    // SAFETY: range checked above.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), map.as_mut_ptr().add(pos), bytes.len());
    }
    Ok(())
}

fn copy_from_map(map: &MmapRaw, pos: usize, out: &mut [u8]) -> Result<()> {
    check_mapped(map, pos, out.len())?;
    // SAFETY: range checked above.
    unsafe {
        std::ptr::copy_nonoverlapping(map.as_ptr().add(pos), out.as_mut_ptr(), out.len());
    }
    Ok(())
}
