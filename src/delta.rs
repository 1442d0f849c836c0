//! Global delta counter (spec.md §5, §9 "Global delta counter" design note).
//!
//! A single atomic counter with two publication points: the current delta
//! (frontends tag new dirty buffers with this) and the flushing delta (the
//! backend advances it at the change-barrier). Transitions only happen at
//! the barrier, which the backend holds a lock across.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::types::MAX_DELTA;

/// Wraps a raw delta number into `[0, MAX_DELTA]`. Tags compare by equality
/// only, never by ordering — see `buffer_can_modify` in buffer.rs.
pub fn wrap(delta: u32) -> u32 {
    delta % (MAX_DELTA + 1)
}

/// Process-wide delta state. Frontends read `current()`; the backend alone
/// calls `begin_flush()` under its own exclusion (modeled here as a mutex
/// standing in for "the backend lock" of spec.md §5).
pub struct DeltaCounter {
    current: AtomicU32,
    flushing: AtomicU32,
    barrier: Mutex<()>,
}

impl DeltaCounter {
    pub fn new() -> Self {
        DeltaCounter {
            current: AtomicU32::new(0),
            flushing: AtomicU32::new(wrap(u32::MAX)), // BUFDELTA_AVAIL-equivalent: none flushing
            barrier: Mutex::new(()),
        }
    }

    /// The delta new mutations should be tagged with.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// The delta currently being flushed by the backend, if any.
    pub fn flushing(&self) -> Option<u32> {
        let f = self.flushing.load(Ordering::Acquire);
        if f == wrap(u32::MAX) { None } else { Some(f) }
    }

    /// Cross the change-barrier: delta `d` stops accepting new dirtying and
    /// becomes read-only for flush; subsequent mutations target `d+1`.
    /// Returns the delta that just began flushing.
    pub fn begin_flush(&self) -> u32 {
        let _guard = self.barrier.lock().unwrap();
        let d = self.current.load(Ordering::Acquire);
        self.flushing.store(d, Ordering::Release);
        self.current.store(wrap(d + 1), Ordering::Release);
        d
    }

    /// The backend calls this once delta `d`'s flush has reached stable
    /// storage; no dirty buffer may carry a tag older than this afterward
    /// (spec.md §8, "Delta-tag monotonicity").
    pub fn finish_flush(&self, _d: u32) {
        let _guard = self.barrier.lock().unwrap();
        self.flushing.store(wrap(u32::MAX), Ordering::Release);
    }
}

impl Default for DeltaCounter {
    fn default() -> Self {
        Self::new()
    }
}
