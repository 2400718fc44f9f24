//! Typed heap positions
//!
//! Slot positions and record positions are distinct newtypes so one can never
//! be used where the other is expected. Neither is a pointer: every access
//! goes through the bounds-checked accessors of `HeapAllocator`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a slot in the slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(u64);

impl SlotIndex {
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Next slot, wrapping at `capacity`
    pub fn wrapping_next(self, capacity: u64) -> Self {
        Self((self.0 + 1) % capacity)
    }

    /// Encode as a `next` link word (0 means "no link")
    pub(crate) fn to_link(self) -> u64 {
        self.0 + 1
    }

    /// Decode a `next` link word
    pub(crate) fn from_link(word: u64) -> Option<Self> {
        word.checked_sub(1).map(Self)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Byte position of a record inside the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordOffset(u64);

impl RecordOffset {
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// The two words stored in every slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotField {
    /// Where the slot's record lives (or available / removed)
    Record,

    /// Next slot of the collision chain
    Next,
}

impl SlotField {
    pub(crate) fn word_index(self) -> usize {
        match self {
            SlotField::Record => 0,
            SlotField::Next => 1,
        }
    }
}

/// Decoded state of a slot's `record` word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never written
    Available,

    /// Record physically removed; the chain link is kept
    Removed,

    /// Holds the record at the given offset
    Occupied(RecordOffset),
}

/// `record` word of a slot that was never written
pub(crate) const AVAILABLE_WORD: u64 = 0;

/// `record` word of a slot whose record was removed
pub(crate) const REMOVED_WORD: u64 = u64::MAX;

impl SlotState {
    pub(crate) fn from_word(word: u64) -> Self {
        match word {
            AVAILABLE_WORD => SlotState::Available,
            REMOVED_WORD => SlotState::Removed,
            w => SlotState::Occupied(RecordOffset::new(w - 1)),
        }
    }

    pub(crate) fn to_word(self) -> u64 {
        match self {
            SlotState::Available => AVAILABLE_WORD,
            SlotState::Removed => REMOVED_WORD,
            SlotState::Occupied(offset) => offset.get() + 1,
        }
    }
}
