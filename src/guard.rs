//! Concurrency guard
//!
//! One reader-writer lock with a configurable discipline:
//!
//! ```text
//! Mode            read()              write()
//! ─────────────── ─────────────────── ─────────
//! Exclusive       exclusive lock      exclusive
//! ReadWrite       shared lock         exclusive
//! LockFreeReads   shared lock         exclusive
//! ```
//!
//! In `LockFreeReads` mode callers may skip `read()` entirely for data that
//! is safe to read without a lock (the heap slot table). Anything else still
//! goes through `read()`.

use std::ops::Deref;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::LockMode;

/// Read access handed out by `ConcurrencyGuard::read`
pub enum ReadAccess<'a, T> {
    Shared(RwLockReadGuard<'a, T>),
    Exclusive(RwLockWriteGuard<'a, T>),
}

impl<T> Deref for ReadAccess<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            ReadAccess::Shared(guard) => guard,
            ReadAccess::Exclusive(guard) => guard,
        }
    }
}

/// `RwLock` whose read side follows a `LockMode`
pub struct ConcurrencyGuard<T> {
    mode: LockMode,
    lock: RwLock<T>,
}

impl<T> ConcurrencyGuard<T> {
    pub fn new(mode: LockMode, value: T) -> Self {
        Self {
            mode,
            lock: RwLock::new(value),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether lock-free reads are allowed for data that supports them
    pub fn lock_free_reads(&self) -> bool {
        self.mode == LockMode::LockFreeReads
    }

    pub fn read(&self) -> ReadAccess<'_, T> {
        match self.mode {
            LockMode::Exclusive => ReadAccess::Exclusive(self.lock.write()),
            LockMode::ReadWrite | LockMode::LockFreeReads => ReadAccess::Shared(self.lock.read()),
        }
    }

    /// Exclusive access, whatever the mode
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.lock.write()
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner()
    }
}
