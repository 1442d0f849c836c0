//! File-map (spec.md §4.6, component C6): resolves and installs the
//! logical-to-physical mapping for a byte range of one file's B-tree.
//!
//! Grounded on `original_source/user/kernel/filemap.c`'s `filemap`/
//! `map_region` control flow: consult the direct-extent fast path first,
//! otherwise walk leaves via the cursor, consulting [`Balloc`] for any hole
//! that a write needs to fill and handing the resulting segments to
//! [`Dleaf::write`]/[`Dleaf::read`].

use crate::balloc::Balloc;
use crate::btree::{Btree, WriteStatus};
use crate::buffer::{AddressSpace, BufferCache};
use crate::cursor::{cursor_advance, leaf_upper_bound};
use crate::dleaf::{Dleaf, DleafReadReq, DleafWriteReq};
use crate::error::{Result, TuxError};
use crate::fork::ForkRegistry;
use crate::types::{BtreeRoot, MapMode, SegState, Segment, TuxkeyT};
use crate::Config;

pub struct Filemap<'a, A: AddressSpace, B: Balloc> {
    cache: &'a BufferCache<A>,
    forks: &'a ForkRegistry,
    balloc: &'a B,
    config: Config,
}

impl<'a, A: AddressSpace, B: Balloc> Filemap<'a, A, B> {
    pub fn new(cache: &'a BufferCache<A>, forks: &'a ForkRegistry, balloc: &'a B, blocksize: usize) -> Self {
        Self::with_config(cache, forks, balloc, Config::new(blocksize))
    }

    /// As [`Filemap::new`], but taking the tunables (block size, direct-
    /// extent ceiling) from a [`Config`] a host derived once for the whole
    /// volume, instead of re-deriving `entries_per_node` per call.
    pub fn with_config(cache: &'a BufferCache<A>, forks: &'a ForkRegistry, balloc: &'a B, config: Config) -> Self {
        Filemap { cache, forks, balloc, config }
    }

    fn blocksize(&self) -> usize {
        self.config.blocksize
    }

    fn btree(&self) -> Btree<'a, A, Dleaf, B> {
        Btree::with_config(self.cache, self.forks, self.balloc, self.config)
    }

    /// `filemap(inode, start, count, mode)`: resolve (and in `Write`/
    /// `Redirect` modes, install) the mapping for `[start, start+count)`.
    /// Returns the segments covering the range, in order, holes included.
    pub fn filemap(
        &self,
        root: &mut BtreeRoot,
        start: TuxkeyT,
        count: u32,
        mode: MapMode,
        delta: u32,
    ) -> Result<Vec<Segment>> {
        match mode {
            MapMode::Read => self.read(root, start, count),
            MapMode::Write | MapMode::Redirect => self.write(root, start, count, mode, delta),
        }
    }

    fn read_direct(&self, root: &BtreeRoot, start: TuxkeyT, count: u32) -> Vec<Segment> {
        let stop = start.saturating_add(count as u64);
        let direct_stop = root.direct_count as u64;
        let mut out = Vec::new();
        if start < direct_stop {
            let seg_stop = stop.min(direct_stop);
            out.push(Segment {
                key: start,
                block: root.direct_block + start,
                count: (seg_stop - start) as u32,
                state: SegState::Mapped,
            });
            if seg_stop < stop {
                out.push(Segment { key: seg_stop, block: 0, count: (stop - seg_stop) as u32, state: SegState::Hole });
            }
        } else {
            out.push(Segment { key: start, block: 0, count, state: SegState::Hole });
        }
        out
    }

    pub fn read(&self, root: &BtreeRoot, start: TuxkeyT, count: u32) -> Result<Vec<Segment>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if root.direct {
            return Ok(self.read_direct(root, start, count));
        }
        if root.depth == 0 {
            return Ok(vec![Segment { key: start, block: 0, count, state: SegState::Hole }]);
        }

        let stop = start.saturating_add(count as u64);
        let btree = self.btree();
        let mut cursor = btree.probe(*root, start)?;
        let mut out = Vec::new();
        let mut pos = start;
        loop {
            let bound = leaf_upper_bound(&cursor).min(stop);
            let bytes = cursor.leaf().read_data().clone();
            let mut req = DleafReadReq { key: pos, count: (bound - pos) as u32, result: Vec::new() };
            Dleaf::read(&bytes, &mut req);
            out.extend(req.result);
            pos = bound;
            if pos >= stop {
                break;
            }
            if !cursor_advance(self.cache, &mut cursor)? {
                out.push(Segment { key: pos, block: 0, count: (stop - pos) as u32, state: SegState::Hole });
                break;
            }
        }
        Ok(out)
    }

    /// Fold a direct extent into a freshly allocated single-leaf tree, so
    /// subsequent writes can go through the generic B-tree path.
    fn promote_direct(&self, root: &mut BtreeRoot, delta: u32) -> Result<()> {
        let btree = self.btree();
        let mut new_root = btree.alloc_empty(delta)?;
        let cursor = btree.probe(new_root, 0)?;
        let leaf_buf = cursor.leaf().clone();
        let mut bytes = leaf_buf.read_data().clone();
        let mut req = DleafWriteReq {
            segments: vec![Segment { key: 0, block: root.direct_block, count: root.direct_count, state: SegState::Mapped }],
        };
        Dleaf::write(&mut bytes, self.blocksize(), &mut req)?;
        *leaf_buf.write_data() = bytes;
        self.cache.dirty(&leaf_buf, delta);
        new_root.direct = false;
        *root = new_root;
        Ok(())
    }

    /// Allocate exactly `need` blocks, looping the allocator's `find`
    /// contract (spec.md §4.6) as many times as it takes to either satisfy
    /// the request or run out of space.
    fn allocate(&self, need: u32) -> Result<Vec<crate::types::Extent>> {
        let mut segs = Vec::new();
        let mut remaining = need;
        while remaining > 0 {
            let (found, still_remaining) = self.balloc.find(64, remaining)?;
            if found.is_empty() {
                return Err(TuxError::OutOfSpace);
            }
            segs.extend(found);
            remaining = still_remaining;
        }
        self.balloc.use_segments(&segs)?;
        Ok(segs)
    }

    fn write(&self, root: &mut BtreeRoot, start: TuxkeyT, count: u32, mode: MapMode, delta: u32) -> Result<Vec<Segment>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        if root.depth == 0 && !root.direct && start == 0 && count <= self.config.max_direct_count {
            let segs = self.allocate(count)?;
            if segs.len() == 1 {
                root.direct = true;
                root.direct_block = segs[0].block;
                root.direct_count = count;
                return Ok(vec![Segment { key: 0, block: segs[0].block, count, state: SegState::NewlyAllocated }]);
            }
            // Couldn't get one contiguous run from the allocator; fall
            // back to a real tree below by freeing these and re-deriving.
            for seg in &segs {
                self.balloc.defer_bfree(seg.block, seg.count);
            }
        }

        if root.direct {
            // Direct-extent policy (spec.md §4.6): eligible iff start == 0,
            // count is within the direct-extent ceiling, and count >= the
            // existing direct count (no partial overwrite of a direct
            // extent). Eligible writes always replace the whole extent:
            // allocate one fresh segment sized for the new length, free the
            // old direct blocks, and overwrite the root descriptor —
            // matching `original_source/user/kernel/filemap.c`'s
            // `map_direct`, which never checks the new blocks for
            // contiguity with the old ones.
            if start == 0 && count <= self.config.max_direct_count && count >= root.direct_count {
                let segs = self.allocate(count)?;
                let new_block = segs[0].block;
                self.balloc.defer_bfree(root.direct_block, root.direct_count);
                self.balloc.log_bfree(root.direct_block, root.direct_count);
                root.direct_block = new_block;
                root.direct_count = count;
                return Ok(vec![Segment { key: 0, block: new_block, count, state: SegState::NewlyAllocated }]);
            }
            self.promote_direct(root, delta)?;
        }

        if root.depth == 0 {
            *root = self.btree().alloc_empty(delta)?;
        }

        let btree = self.btree();
        let mut cursor = btree.probe(*root, start)?;
        if mode == MapMode::Redirect {
            btree.cursor_redirect(&mut cursor, root, 0, delta)?;
        }

        let segs = self.allocate(count)?;
        let mut segments = Vec::with_capacity(segs.len());
        let mut key = start;
        for ext in &segs {
            segments.push(Segment { key, block: ext.block, count: ext.count, state: SegState::NewlyAllocated });
            key += ext.count as u64;
        }

        let mut req = DleafWriteReq { segments: segments.clone() };
        loop {
            let leaf_buf = cursor.leaf().clone();
            if leaf_buf.needs_fork(delta) {
                return Err(TuxError::Invariant(format!(
                    "leaf {} needs fork before write; cursor_redirect first",
                    leaf_buf.index
                )));
            }
            let mut bytes = leaf_buf.read_data().clone();

            match Dleaf::write(&mut bytes, self.blocksize(), &mut req)? {
                WriteStatus::Done => {
                    *leaf_buf.write_data() = bytes;
                    self.cache.dirty(&leaf_buf, delta);
                    break;
                }
                WriteStatus::Retry => {
                    *leaf_buf.write_data() = bytes;
                    self.cache.dirty(&leaf_buf, delta);
                    if !cursor_advance(self.cache, &mut cursor)? {
                        let new_block = self.balloc.alloc_one()?;
                        let new_buf = self.cache.get(new_block);
                        *new_buf.write_data() = Dleaf::init(self.blocksize());
                        self.cache.dirty(&new_buf, delta);
                        let sep = req.segments[0].key;
                        btree.insert_leaf(root, &mut cursor, delta, sep, new_block)?;
                        cursor_advance(self.cache, &mut cursor)?;
                    }
                }
                WriteStatus::Split => {
                    let (right_bytes, sep) = Dleaf::split(&mut bytes, self.blocksize());
                    *leaf_buf.write_data() = bytes;
                    self.cache.dirty(&leaf_buf, delta);
                    let new_block = self.balloc.alloc_one()?;
                    let right_buf = self.cache.get(new_block);
                    *right_buf.write_data() = right_bytes;
                    self.cache.dirty(&right_buf, delta);
                    btree.insert_leaf(root, &mut cursor, delta, sep, new_block)?;
                    if req.segments.first().map_or(false, |s| s.key >= sep) {
                        cursor_advance(self.cache, &mut cursor)?;
                    }
                }
            }
        }
        Ok(segments)
    }
}
