//! Block-buffer cache with delta tagging (spec.md §4.1, component C1).
//!
//! Grounded on `original_source/user/kernel/buffer.c`'s
//! `tux3_set_bufdelta`/`tux3_clear_bufdelta`/`buffer_can_modify`, replacing
//! the C source's two-step "mark dirty, then separately cmpxchg the tag"
//! hack (explicitly noted there as racy) with a single combined state word,
//! per spec.md §9's design note.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::error::{Result, TuxError};
use crate::types::BUFDELTA_AVAIL;

const DIRTY_BIT: u32 = 1 << 0;
const TAG_SHIFT: u32 = 1;
const TAG_MASK: u32 = 0b1111; // 4 bits, covers 0..=BUFDELTA_AVAIL

fn pack(dirty: bool, tag: u32) -> u32 {
    (if dirty { DIRTY_BIT } else { 0 }) | ((tag & TAG_MASK) << TAG_SHIFT)
}

fn unpack(word: u32) -> (bool, u32) {
    (word & DIRTY_BIT != 0, (word >> TAG_SHIFT) & TAG_MASK)
}

/// A cached block-sized slab plus its dirty/delta-tag state.
///
/// The state word packs the dirty flag and the delta tag together so a
/// reader never observes one without the other (spec.md §4.1's atomicity
/// contract).
pub struct Buffer {
    pub index: u64,
    data: Mutex<Vec<u8>>,
    state: AtomicU32,
    filled: AtomicU32, // 0 = empty, 1 = filled; plain bool would also do
}

impl Buffer {
    fn new_empty(index: u64, blocksize: usize) -> Self {
        Buffer {
            index,
            data: Mutex::new(vec![0u8; blocksize]),
            state: AtomicU32::new(pack(false, BUFDELTA_AVAIL)),
            filled: AtomicU32::new(0),
        }
    }

    pub fn is_dirty(&self) -> bool {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// The delta tag, if the buffer is dirty. `None` for a clean buffer.
    pub fn delta_tag(&self) -> Option<u32> {
        let (dirty, tag) = unpack(self.state.load(Ordering::Acquire));
        if dirty { Some(tag) } else { None }
    }

    /// `buffer_can_modify` (spec.md §4.1): true iff the tag equals `delta`.
    /// Only meaningful for a dirty buffer; spins if the tag is mid-publish
    /// (never observable with this crate's single-CAS `dirty()`, but kept
    /// so the contract holds even if a future caller splits the steps).
    pub fn can_modify(&self, delta: u32) -> bool {
        loop {
            let (dirty, tag) = unpack(self.state.load(Ordering::Acquire));
            debug_assert!(dirty, "can_modify called on a clean buffer");
            if tag == BUFDELTA_AVAIL {
                std::hint::spin_loop();
                continue;
            }
            return tag == delta;
        }
    }

    pub fn needs_fork(&self, delta: u32) -> bool {
        self.is_dirty() && !self.can_modify(delta)
    }

    pub fn read_data(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }

    pub fn write_data(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }

    fn set_data(&self, bytes: Vec<u8>) {
        *self.data.lock().unwrap() = bytes;
        self.filled.store(1, Ordering::Release);
    }

    fn clone_data(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

/// External read callback contract an address space must supply (spec.md
/// §4.1's "fills by calling the address-space's read callback").
pub trait AddressSpace {
    fn read_block(&self, index: u64) -> Result<Vec<u8>>;
    fn blocksize(&self) -> usize;
}

struct Inner {
    index: HashMap<u64, Arc<Buffer>>,
    dirty_lists: HashMap<u32, Vec<Arc<Buffer>>>,
}

/// Per-address-space cache: maps (implicit address space, block index) to
/// a cached [`Buffer`], and tracks per-delta dirty-list membership.
///
/// `inner` stands in for spec.md §5's "per-address-space private lock".
pub struct BufferCache<A: AddressSpace> {
    addr_space: A,
    inner: Mutex<Inner>,
}

impl<A: AddressSpace> BufferCache<A> {
    pub fn new(addr_space: A) -> Self {
        BufferCache {
            addr_space,
            inner: Mutex::new(Inner { index: HashMap::new(), dirty_lists: HashMap::new() }),
        }
    }

    /// `get(addr_space, index)`: creates an empty buffer if absent.
    pub fn get(&self, index: u64) -> Arc<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .index
            .entry(index)
            .or_insert_with(|| Arc::new(Buffer::new_empty(index, self.addr_space.blocksize())))
            .clone()
    }

    /// `peek(addr_space, index)`: look without creating.
    pub fn peek(&self, index: u64) -> Option<Arc<Buffer>> {
        self.inner.lock().unwrap().index.get(&index).cloned()
    }

    /// `read(addr_space, index)`: fills by calling the address-space's read
    /// callback on first access.
    pub fn read(&self, index: u64) -> Result<Arc<Buffer>> {
        let buf = self.get(index);
        if buf.filled.load(Ordering::Acquire) == 0 {
            let bytes = self.addr_space.read_block(index)?;
            buf.set_data(bytes);
        }
        Ok(buf)
    }

    /// `dirty(buffer, delta)`: sets the dirty flag, stores the delta tag,
    /// and splices the buffer onto the per-delta dirty list. Idempotent if
    /// the buffer is already dirty in `delta`.
    pub fn dirty(&self, buffer: &Arc<Buffer>, delta: u32) {
        let mut inner = self.inner.lock().unwrap();
        let (was_dirty, prev_tag) = unpack(buffer.state.load(Ordering::Acquire));
        if was_dirty && prev_tag == delta {
            return;
        }
        if was_dirty {
            if let Some(list) = inner.dirty_lists.get_mut(&prev_tag) {
                list.retain(|b| !Arc::ptr_eq(b, buffer));
            }
        }
        buffer.state.store(pack(true, delta), Ordering::Release);
        inner.dirty_lists.entry(delta).or_default().push(buffer.clone());
        trace!("buffer {} dirtied in delta {delta}", buffer.index);
    }

    /// `clear_dirty(buffer, delta)`: valid only when the buffer matches
    /// `delta` or is not dirty; panics (the core's `Invariant` kind) if the
    /// buffer still needs forking, per spec.md §4.1.
    pub fn clear_dirty(&self, buffer: &Arc<Buffer>, delta: u32) -> Result<()> {
        if buffer.needs_fork(delta) {
            return Err(TuxError::Invariant(format!(
                "clear_dirty on buffer {} that still needs forking",
                buffer.index
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let (dirty, tag) = unpack(buffer.state.load(Ordering::Acquire));
        if dirty {
            if let Some(list) = inner.dirty_lists.get_mut(&tag) {
                list.retain(|b| !Arc::ptr_eq(b, buffer));
            }
            buffer.state.store(pack(false, BUFDELTA_AVAIL), Ordering::Release);
        }
        Ok(())
    }

    /// `invalidate(buffer)`: drop it from the cache index and its dirty
    /// list, per `tux3_invalidate_buffer`'s must-hold-the-page-lock contract
    /// (enforced by the caller here, not this type).
    pub fn invalidate(&self, index: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buffer) = inner.index.remove(&index) {
            let (dirty, tag) = unpack(buffer.state.load(Ordering::Acquire));
            if dirty {
                if let Some(list) = inner.dirty_lists.get_mut(&tag) {
                    list.retain(|b| !Arc::ptr_eq(b, &buffer));
                }
            }
        }
    }

    /// All buffers dirty in `delta`, for the backend to flush.
    pub fn dirty_blocks(&self, delta: u32) -> Vec<Arc<Buffer>> {
        self.inner
            .lock()
            .unwrap()
            .dirty_lists
            .get(&delta)
            .cloned()
            .unwrap_or_default()
    }

    pub fn address_space(&self) -> &A {
        &self.addr_space
    }
}

/// Copy a buffer's current contents; used by [`crate::fork`] to seed a
/// forked buffer without holding the cache lock across the memcpy.
pub fn snapshot_data(buffer: &Buffer) -> Vec<u8> {
    buffer.clone_data()
}
