//! Crash Log Module
//!
//! Makes a batch of heap mutations atomic across process death.
//!
//! ## Responsibilities
//! - `begin` / `end` bracket one batch (no nesting)
//! - Record the previous value of every slot word before it changes
//! - On startup, undo an interrupted batch before any operation is accepted
//!
//! ## File Format
//! ```text
//! heap.log (exists only while a batch is in flight)
//! ┌─────────────────────────────────────────┐
//! │ Entry 0: Begin { batch }                │
//! │ ┌─────────┬─────────┬─────────────────┐ │
//! │ │ Len (4) │ CRC (4) │ bincode(entry)  │ │
//! │ └─────────┴─────────┴─────────────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry n: SlotWrite { slot, field, prev }│
//! └─────────────────────────────────────────┘
//! ```
//!
//! Record bytes are append-only and never referenced until a slot word points
//! at them, so undoing slot words alone restores the pre-batch heap.

mod entry;
mod recovery;
mod writer;

#[cfg(any(test, feature = "fault-injection"))]
mod failure;

pub use entry::{Frame, LogEntry, LogOp, FRAME_HEADER_SIZE};
pub use recovery::{LogRecovery, RecoveryReport};
pub use writer::CrashLog;

#[cfg(any(test, feature = "fault-injection"))]
pub use failure::{FailingJournal, FailureTrack};

/// Crash log file name
pub const LOG_FILENAME: &str = "heap.log";
