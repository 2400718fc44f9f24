//! Fault injection for crash-consistency tests
//!
//! Only compiled for tests or with the `fault-injection` feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{FlatError, Result};
use crate::heap::{SlotField, SlotIndex};
use crate::index::SlotJournal;

/// Shared countdown that fires exactly once
///
/// `FailureTrack::new(n)` lets `n` checks pass and fails the next one.
#[derive(Debug, Clone)]
pub struct FailureTrack {
    /// Checks left until the failing one, 0 once fired
    remaining: Arc<AtomicU64>,
}

impl FailureTrack {
    pub fn new(steps: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(steps.saturating_add(1))),
        }
    }

    /// Consume one step; true only for the failing step
    pub fn should_fail_now(&self) -> bool {
        matches!(
            self.remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1)),
            Ok(1)
        )
    }

    /// Whether the failure already fired
    pub fn has_fired(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }

    /// `Err(InjectedFailure)` on the failing step
    pub fn check(&self) -> Result<()> {
        if self.should_fail_now() {
            tracing::debug!("Injected failure");
            Err(FlatError::InjectedFailure)
        } else {
            Ok(())
        }
    }
}

/// Journal that consults a `FailureTrack` before every slot write
pub struct FailingJournal<'a, J: ?Sized> {
    inner: &'a mut J,
    track: &'a FailureTrack,
}

impl<'a, J: SlotJournal + ?Sized> FailingJournal<'a, J> {
    pub fn new(inner: &'a mut J, track: &'a FailureTrack) -> Self {
        Self { inner, track }
    }
}

impl<J: SlotJournal + ?Sized> SlotJournal for FailingJournal<'_, J> {
    fn record(&mut self, slot: SlotIndex, field: SlotField, previous: u64) -> Result<()> {
        self.track.check()?;
        self.inner.record(slot, field, previous)
    }
}
