//! Hash Index Module
//!
//! Persistent, capacity-bounded hash table over the heap.
//!
//! ## Responsibilities
//! - Start slot = slot hash of the key mod capacity
//! - Collisions resolved by explicit `next` links stored in the slot table
//!   (chains may coalesce; keys are always compared in full)
//! - Insert-only for values: the first writer of a key wins
//! - Optional tombstones and physical removal, fixed at creation
//!
//! ## Write Ordering
//! ```text
//! 1. append record bytes        (data_end advances)
//! 2. link    tail.next = slot   (journaled)
//! 3. publish slot.record = off  (journaled)
//! ```
//! A reader that sees a published slot always sees a complete record. A crash
//! between steps leaves an unreferenced record or a link to an available
//! slot, both of which lookups treat as the end of the chain.

mod stats;
mod table;

pub use stats::HeapStats;
pub use table::{HashIndex, IndexOptions, PutOutcome};

use crate::error::Result;
use crate::heap::{SlotField, SlotIndex};

/// Receives every slot-word mutation before it is applied
pub trait SlotJournal {
    /// `previous` is the word being overwritten
    fn record(&mut self, slot: SlotIndex, field: SlotField, previous: u64) -> Result<()>;
}

/// Journal for writes outside of a batch
#[derive(Debug, Default, Clone, Copy)]
pub struct Unjournaled;

impl SlotJournal for Unjournaled {
    fn record(&mut self, _slot: SlotIndex, _field: SlotField, _previous: u64) -> Result<()> {
        Ok(())
    }
}
