//! Buffer-fork (spec.md §4.2, component C2).
//!
//! Grounded on `original_source/user/kernel/buffer.c` (the dirty-list
//! splice this forks out of) and the design note in spec.md §9 calling for
//! a non-owning back-reference instead of a direct pointer cycle between a
//! buffer and its cache slot — `ForkRegistry` holds `Arc<Buffer>`s, never
//! raw pointers, and idempotence is keyed by pointer identity plus delta.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::buffer::{snapshot_data, AddressSpace, Buffer, BufferCache};
use crate::error::{Result, TuxError};

/// (original buffer identity, forking delta) — the idempotence key. Keying
/// on the raw pointer address of the `Arc`'s allocation is safe here
/// because a [`Buffer`] is never deallocated while a fork referencing it is
/// live (the original is retained in `pending_release` until flushed).
type ForkKey = (usize, u32);

fn fork_key(orig: &Arc<Buffer>) -> usize {
    Arc::as_ptr(orig) as usize
}

/// Process-wide registry of forked buffers (spec.md §4.2's "process-wide
/// list of forked buffers"), so the flusher can release originals once
/// their delta completes, and so a second fork of the same buffer in the
/// same delta returns the buffer already produced.
pub struct ForkRegistry {
    idempotence: Mutex<HashMap<ForkKey, Arc<Buffer>>>,
    pending_release: Mutex<Vec<(Arc<Buffer>, u32)>>,
}

impl ForkRegistry {
    pub fn new() -> Self {
        ForkRegistry {
            idempotence: Mutex::new(HashMap::new()),
            pending_release: Mutex::new(Vec::new()),
        }
    }

    /// Fork `orig` (dirty in some prior delta) into a fresh buffer at
    /// `new_index`, owned by `new_delta`. Idempotent: forking the same
    /// `(orig, new_delta)` pair twice returns the same forked buffer
    /// without copying again.
    pub fn fork<A: AddressSpace>(
        &self,
        cache: &BufferCache<A>,
        orig: &Arc<Buffer>,
        new_delta: u32,
        new_index: u64,
    ) -> Result<Arc<Buffer>> {
        let key = (fork_key(orig), new_delta);
        {
            let idem = self.idempotence.lock().unwrap();
            if let Some(existing) = idem.get(&key) {
                return Ok(existing.clone());
            }
        }

        // The allocation step that can legitimately fail (spec.md §4.2:
        // "Failure to allocate is fatal to the in-progress write").
        let forked = cache.get(new_index);
        let contents = snapshot_data(orig);
        {
            let mut data = forked.write_data();
            if data.len() != contents.len() {
                return Err(TuxError::OutOfMemory);
            }
            *data = contents;
        }
        cache.dirty(&forked, new_delta);

        let mut idem = self.idempotence.lock().unwrap();
        // Another thread may have raced us to the same fork; keep theirs so
        // every caller observing this key sees one buffer (idempotence).
        let winner = idem.entry(key).or_insert_with(|| forked.clone()).clone();
        drop(idem);

        self.pending_release.lock().unwrap().push((orig.clone(), new_delta));
        debug!("forked buffer {} -> {} for delta {new_delta}", orig.index, winner.index);
        Ok(winner)
    }

    /// Release every original buffer forked on behalf of `delta`, once the
    /// backend has finished flushing it. Returns the originals so the
    /// caller can drop the cache's last reference to them.
    pub fn release_flushed(&self, delta: u32) -> Vec<Arc<Buffer>> {
        let mut pending = self.pending_release.lock().unwrap();
        let (released, remaining): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|(_, d)| *d == delta);
        *pending = remaining;

        let mut idem = self.idempotence.lock().unwrap();
        idem.retain(|(_, d), _| *d != delta);

        released.into_iter().map(|(b, _)| b).collect()
    }
}

impl Default for ForkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
