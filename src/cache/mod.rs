//! Cache Module
//!
//! Write-back cache tiers in front of a `Backend`.
//!
//! ## Responsibilities
//! - Serve reads from memory before touching the base store
//! - Stage writes and deletes until a flush turns them into one batch
//! - Remember what the base store is known to hold (or not hold)
//!
//! ## Tiers
//! ```text
//!            get                      put / delete
//!             │                            │
//!   ┌─────────▼─────────┐                  │
//!   │ committed (LRU)   │◀── flush merge ──┤
//!   │ confirmed state   │                  │
//!   └─────────┬─────────┘        ┌─────────▼─────────┐
//!             │ miss             │ uncommitted       │
//!             └─────────────────▶│ pending, ordered  │
//!                                └─────────┬─────────┘
//!                                          │ miss / flush
//!                                ┌─────────▼─────────┐
//!                                │ Backend           │
//!                                └───────────────────┘
//! ```
//! A key is never in both tiers at once.
//!
//! When the base store drops removals, flushed deletes are remembered in a
//! removed-key set instead, persisted in `cache.snap` next to the optional
//! committed-tier snapshot.

mod committed;
mod layer;
mod snapshot;
mod stats;

use serde::{Deserialize, Serialize};

pub use committed::CommittedCache;
pub use layer::CacheLayer;
pub use snapshot::{CacheSnapshot, SNAPSHOT_FILENAME};
pub use stats::{CacheStats, StatsSnapshot};

/// Entry held by either cache tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEntry {
    /// A live value
    Value(Vec<u8>),

    /// Known absent
    Tombstone,
}

impl CacheEntry {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, CacheEntry::Tombstone)
    }

    /// The value, or `None` for a tombstone
    pub fn value(&self) -> Option<&Vec<u8>> {
        match self {
            CacheEntry::Value(value) => Some(value),
            CacheEntry::Tombstone => None,
        }
    }
}
