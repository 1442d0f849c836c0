//! `balloc` contract consumed by this core (spec.md §6), plus a minimal
//! in-memory reference implementation used by tests.
//!
//! Grounded on `original_source/user/kernel/filemap.c`'s `seg_find`/
//! `seg_alloc`/`map_bfree`, which drive exactly this three-call contract:
//! find candidate segments, commit a prefix of them, and defer/log frees
//! for blocks a chop or redirect makes unreachable.

use std::collections::BTreeSet;
use std::sync::Mutex;

use log::trace;

use crate::error::{Result, TuxError};
use crate::types::{BlockT, Extent, SegState};

/// External free-space allocator contract. The real allocator (a bitmap,
/// out of scope for this core) must not re-enter any operation on this
/// crate — spec.md §9's "explicit no-reentry contract".
pub trait Balloc {
    /// `balloc_find`: return up to `max_segs` segments covering as much of
    /// `len` blocks as possible, plus the length still unsatisfied. Never
    /// returns `OutOfSpace` for a length the frontend already reserved;
    /// doing so is a bug in this core (spec.md §7).
    fn find(&self, max_segs: usize, len: u32) -> Result<(Vec<Extent>, u32)>;

    /// `balloc_use`: commit a prefix of previously-found segments.
    fn use_segments(&self, segs: &[Extent]) -> Result<()>;

    /// Allocate exactly one block, for a new leaf/internal-node sibling or
    /// a forked buffer's destination address.
    fn alloc_one(&self) -> Result<BlockT>;

    /// `defer_bfree`: queue a free to apply at delta commit (not
    /// immediately — spec.md §4.5's "Overwrite vs redirect").
    fn defer_bfree(&self, block: BlockT, count: u32);

    /// `log_bfree`: record the free to the transaction log (external,
    /// out of scope; this core only needs the call site to exist).
    fn log_bfree(&self, block: BlockT, count: u32);
}

/// Minimal in-memory allocator satisfying [`Balloc`]'s contract: a free
/// block-number set plus a deferred-free queue. Not a real free-space
/// bitmap (that's external per spec.md §1) — just enough to drive
/// `filemap` and the seed-scenario tests end to end.
pub struct VecBalloc {
    free: Mutex<BTreeSet<BlockT>>,
    deferred: Mutex<Vec<(BlockT, u32)>>,
}

impl VecBalloc {
    pub fn new(total_blocks: BlockT) -> Self {
        VecBalloc {
            free: Mutex::new((1..total_blocks).collect()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Blocks queued by `defer_bfree` but not yet returned to the free set
    /// (the "apply at delta commit" step spec.md §4.6 leaves as a TODO for
    /// unused reservations, but deferred frees of chopped/redirected
    /// extents still need to land somewhere observable for tests).
    pub fn deferred_frees(&self) -> Vec<(BlockT, u32)> {
        self.deferred.lock().unwrap().clone()
    }

    /// Apply deferred frees back to the free set — stands in for "delta
    /// commit completed" from the allocator's point of view.
    pub fn apply_deferred(&self) {
        let mut deferred = self.deferred.lock().unwrap();
        let mut free = self.free.lock().unwrap();
        for (block, count) in deferred.drain(..) {
            for b in block..block + count as u64 {
                free.insert(b);
            }
        }
    }
}

impl Balloc for VecBalloc {
    fn find(&self, max_segs: usize, len: u32) -> Result<(Vec<Extent>, u32)> {
        let mut free = self.free.lock().unwrap();
        let mut segs = Vec::new();
        let mut remaining = len;
        while remaining > 0 && segs.len() < max_segs {
            let Some(&start) = free.iter().next() else { break };
            let mut run = 0u32;
            while run < remaining && free.contains(&(start + run as u64)) {
                run += 1;
            }
            for block in start..start + run as u64 {
                free.remove(&block);
            }
            segs.push(Extent::new(start, run, SegState::Mapped));
            remaining -= run;
        }
        Ok((segs, remaining))
    }

    fn use_segments(&self, _segs: &[Extent]) -> Result<()> {
        // Segments returned by `find` are already removed from the free
        // set; committing them here is a no-op for this reference
        // allocator (a real bitmap allocator would mark them used here).
        Ok(())
    }

    fn alloc_one(&self) -> Result<BlockT> {
        let mut free = self.free.lock().unwrap();
        let block = *free.iter().next().ok_or(TuxError::OutOfSpace)?;
        free.remove(&block);
        Ok(block)
    }

    fn defer_bfree(&self, block: BlockT, count: u32) {
        trace!("defer_bfree {block}/{count}");
        self.deferred.lock().unwrap().push((block, count));
    }

    fn log_bfree(&self, block: BlockT, count: u32) {
        trace!("log_bfree {block}/{count}");
    }
}
