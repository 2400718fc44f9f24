//! # flatstore
//!
//! A crash-consistent key-value engine for content-addressed data:
//! - Write-back cache tiers in front of a pluggable base store
//! - File-backed hash heap with explicit collision chains
//! - Undo log that makes every batch all-or-nothing across crashes
//! - Configurable reader/writer discipline
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                             │
//! │          (get / put / delete / keys / flush / close)        │
//! └─────────────────────┬──────────────────────┬────────────────┘
//!                       │                      │ non-content-addressed
//! ┌─────────────────────▼───────────┐   ┌──────▼──────┐
//! │           CacheLayer            │   │  AuxStore   │
//! │  committed (LRU) / uncommitted  │   │  (aux.kv)   │
//! └─────────────────────┬───────────┘   └─────────────┘
//!                       │ update_batch on flush
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  HeapStore (Backend)                        │
//! │        ConcurrencyGuard · DirLock · description             │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │   HashIndex     │── undo ──────▶ │    CrashLog     │
//!   │  (chains)       │   entries      │   (heap.log)    │
//!   └────────┬────────┘                └─────────────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │  HeapAllocator  │
//!   │ heap.idx/.dat   │
//!   └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod hash;
pub mod heap;
pub mod index;
pub mod crashlog;

pub mod guard;
pub mod lock_file;

pub mod backend;
pub mod aux_store;
pub mod store;
pub mod cache;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use aux_store::AuxStore;
pub use backend::{Backend, MemoryBackend, WriteBatch};
pub use cache::{CacheLayer, StatsSnapshot};
pub use config::{Config, CreationFlags, LockMode, LogSyncStrategy};
pub use crashlog::RecoveryReport;
pub use engine::Engine;
pub use error::{FlatError, Result};
pub use index::HeapStats;
pub use store::HeapStore;

#[cfg(any(test, feature = "fault-injection"))]
pub use crashlog::FailureTrack;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of flatstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
