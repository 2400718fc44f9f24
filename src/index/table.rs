//! Hash Index Implementation

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::config::{CreationFlags, BIG_VALUE_THRESHOLD};
use crate::error::{FlatError, Result};
use crate::hash::{is_content_addressed, slot_hash, SlotHashFn};
use crate::heap::{HeapAllocator, HeapWriter, Record, SlotField, SlotIndex, SlotState};

use super::{HeapStats, SlotJournal};

/// Behaviour fixed when the heap is created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOptions {
    /// Persist tombstones
    pub support_null_values: bool,
    /// Allow physical removal
    pub allow_removals: bool,
    /// Store keys verbatim next to values larger than `BIG_VALUE_THRESHOLD`
    pub support_big_values: bool,
}

impl From<&CreationFlags> for IndexOptions {
    fn from(flags: &CreationFlags) -> Self {
        Self {
            support_null_values: flags.support_null_values,
            allow_removals: flags.allow_removals,
            support_big_values: flags.support_big_values,
        }
    }
}

/// Effect of a write on the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// A slot was claimed
    Inserted,
    /// An existing slot now points at a new record (value <-> tombstone)
    Replaced,
    /// Nothing was written
    Unchanged,
}

/// Where a chain walk stopped
enum WalkEnd {
    /// The key lives in `slot`
    Found { slot: SlotIndex, record: Record },
    /// Key absent; `slot` is already on the chain and can take a record
    Reusable(SlotIndex),
    /// Key absent; the chain ends at this slot
    Tail(SlotIndex),
}

/// Hash table over a `HeapAllocator`
///
/// Reads take `&self` and are safe to run concurrently with the single
/// writer holding the `HeapWriter`.
pub struct HashIndex {
    heap: HeapAllocator,
    options: IndexOptions,
    slot_hash: SlotHashFn,

    /// Occupied slots
    elements: AtomicU64,

    lookups: CachePadded<AtomicU64>,
    slot_checks: CachePadded<AtomicU64>,
}

impl HashIndex {
    pub fn new(heap: HeapAllocator, options: IndexOptions) -> Self {
        Self {
            heap,
            options,
            slot_hash,
            elements: AtomicU64::new(0),
            lookups: CachePadded::new(AtomicU64::new(0)),
            slot_checks: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Replace the slot hash (tests force collisions with it)
    pub fn with_slot_hash(mut self, slot_hash: SlotHashFn) -> Self {
        self.slot_hash = slot_hash;
        self
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value stored for `key`; tombstones read as absent
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.walk(key)? {
            WalkEnd::Found { record, .. } => Ok(record.value),
            WalkEnd::Reusable(_) | WalkEnd::Tail(_) => Ok(None),
        }
    }

    /// Whether `key` holds a tombstone
    pub fn is_tombstoned(&self, key: &[u8]) -> Result<bool> {
        match self.walk(key)? {
            WalkEnd::Found { record, .. } => Ok(record.flags.is_tombstone()),
            _ => Ok(false),
        }
    }

    /// Every key holding a value, by linear scan of the slot table
    pub fn keys(&self) -> Result<BTreeSet<Vec<u8>>> {
        let mut keys = BTreeSet::new();
        for i in 0..self.heap.slot_capacity() {
            if let SlotState::Occupied(offset) = self.heap.slot_state(SlotIndex::new(i))? {
                let record = self.heap.read_record(offset)?;
                if !record.flags.is_tombstone() {
                    keys.insert(record.key());
                }
            }
        }
        Ok(keys)
    }

    /// First slot of the chain for `key`
    pub fn start_slot(&self, key: &[u8]) -> SlotIndex {
        SlotIndex::new((self.slot_hash)(key) % self.heap.slot_capacity())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert `key -> value`; an existing value for the key wins
    pub fn put<J: SlotJournal + ?Sized>(
        &self,
        writer: &mut HeapWriter,
        journal: &mut J,
        key: &[u8],
        value: &[u8],
    ) -> Result<PutOutcome> {
        let record = Record::value(key, value, self.store_key(key, value));
        self.write(writer, journal, key, record)
    }

    /// Persist a tombstone for `key`
    pub fn put_tombstone<J: SlotJournal + ?Sized>(
        &self,
        writer: &mut HeapWriter,
        journal: &mut J,
        key: &[u8],
    ) -> Result<PutOutcome> {
        if !self.options.support_null_values {
            return Err(FlatError::Unsupported(
                "tombstones require support_null_values".into(),
            ));
        }
        self.write(writer, journal, key, Record::tombstone(key))
    }

    /// Physically remove `key`, keeping its chain link
    ///
    /// Returns whether the key was present.
    pub fn remove<J: SlotJournal + ?Sized>(
        &self,
        writer: &mut HeapWriter,
        journal: &mut J,
        key: &[u8],
    ) -> Result<bool> {
        if !self.options.allow_removals {
            return Err(FlatError::Unsupported(
                "removal requires allow_removals".into(),
            ));
        }
        match self.walk(key)? {
            WalkEnd::Found { slot, .. } => {
                self.set_word(writer, journal, slot, SlotField::Record, SlotState::Removed.to_word())?;
                self.elements.fetch_sub(1, Ordering::Relaxed);
                Ok(true)
            }
            WalkEnd::Reusable(_) | WalkEnd::Tail(_) => Ok(false),
        }
    }

    fn write<J: SlotJournal + ?Sized>(
        &self,
        writer: &mut HeapWriter,
        journal: &mut J,
        key: &[u8],
        record: Record,
    ) -> Result<PutOutcome> {
        match self.walk(key)? {
            WalkEnd::Found { slot, record: existing } => {
                // Value over value: first writer wins. Tombstone over tombstone: already absent.
                if existing.flags.is_tombstone() == record.flags.is_tombstone() {
                    return Ok(PutOutcome::Unchanged);
                }
                let offset = self.heap.append_record(writer, &record)?;
                self.set_word(writer, journal, slot, SlotField::Record, SlotState::Occupied(offset).to_word())?;
                Ok(PutOutcome::Replaced)
            }
            WalkEnd::Reusable(slot) => {
                let offset = self.heap.append_record(writer, &record)?;
                self.set_word(writer, journal, slot, SlotField::Record, SlotState::Occupied(offset).to_word())?;
                self.elements.fetch_add(1, Ordering::Relaxed);
                Ok(PutOutcome::Inserted)
            }
            WalkEnd::Tail(tail) => {
                let slot = self.find_available_slot(tail)?;
                let offset = self.heap.append_record(writer, &record)?;
                self.set_word(writer, journal, tail, SlotField::Next, slot.to_link())?;
                self.set_word(writer, journal, slot, SlotField::Record, SlotState::Occupied(offset).to_word())?;
                self.elements.fetch_add(1, Ordering::Relaxed);
                Ok(PutOutcome::Inserted)
            }
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Recompute occupancy after open or recovery
    pub fn rebuild(&self, writer: &mut HeapWriter) -> Result<u64> {
        let occupied = self.heap.rebuild(writer)?;
        self.elements.store(occupied, Ordering::Relaxed);
        Ok(occupied)
    }

    pub fn sync(&self) -> Result<()> {
        self.heap.sync()
    }

    pub fn heap(&self) -> &HeapAllocator {
        &self.heap
    }

    pub fn options(&self) -> IndexOptions {
        self.options
    }

    pub fn element_count(&self) -> u64 {
        self.elements.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            elements: self.element_count(),
            slot_capacity: self.heap.slot_capacity(),
            data_used: self.heap.data_used(),
            data_capacity: self.heap.data_capacity(),
            lookups: self.lookups.load(Ordering::Relaxed),
            slot_checks: self.slot_checks.load(Ordering::Relaxed),
        }
    }

    /// Zero the slot-check counters; occupancy is untouched
    pub fn reset_stats(&self) {
        self.lookups.store(0, Ordering::Relaxed);
        self.slot_checks.store(0, Ordering::Relaxed);
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn walk(&self, key: &[u8]) -> Result<WalkEnd> {
        let capacity = self.heap.slot_capacity();
        let mut slot = self.start_slot(key);
        let mut reusable = None;
        let mut checks = 0u64;

        let end = loop {
            checks += 1;
            if checks > capacity {
                tracing::error!(start = %self.start_slot(key), capacity, "Collision chain does not terminate");
                return Err(FlatError::Corruption(format!(
                    "collision chain from {} exceeds {} slots",
                    self.start_slot(key),
                    capacity
                )));
            }

            match self.heap.slot_state(slot)? {
                SlotState::Available => break WalkEnd::Reusable(reusable.unwrap_or(slot)),
                SlotState::Removed => {
                    reusable.get_or_insert(slot);
                }
                SlotState::Occupied(offset) => {
                    let record = self.heap.read_record(offset)?;
                    if record.matches_key(key) {
                        break WalkEnd::Found { slot, record };
                    }
                }
            }

            match self.heap.next_slot(slot)? {
                Some(next) => slot = next,
                None => {
                    break match reusable {
                        Some(removed) => WalkEnd::Reusable(removed),
                        None => WalkEnd::Tail(slot),
                    }
                }
            }
        };

        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.slot_checks.fetch_add(checks, Ordering::Relaxed);
        Ok(end)
    }

    /// First available slot after `tail`, wrapping around the table
    fn find_available_slot(&self, tail: SlotIndex) -> Result<SlotIndex> {
        let capacity = self.heap.slot_capacity();
        let mut slot = tail;
        for _ in 1..capacity {
            slot = slot.wrapping_next(capacity);
            if self.heap.slot_state(slot)? == SlotState::Available {
                return Ok(slot);
            }
        }
        tracing::warn!(
            elements = self.element_count(),
            capacity,
            "Heap has no available slot"
        );
        Err(FlatError::heap_full(format!(
            "all {} slots are in use",
            capacity
        )))
    }

    fn set_word<J: SlotJournal + ?Sized>(
        &self,
        writer: &mut HeapWriter,
        journal: &mut J,
        slot: SlotIndex,
        field: SlotField,
        word: u64,
    ) -> Result<()> {
        let previous = self.heap.slot_word(slot, field)?;
        journal.record(slot, field, previous)?;
        self.heap.store_slot_word(writer, slot, field, word)
    }

    fn store_key(&self, key: &[u8], value: &[u8]) -> bool {
        !is_content_addressed(key, value)
            || (self.options.support_big_values && value.len() > BIG_VALUE_THRESHOLD)
    }
}
