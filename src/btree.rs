//! Generic B-tree operations (spec.md §4.4, component C4).
//!
//! Polymorphic over a [`LeafOps`] capability set (the spec's "leaf-ops
//! vtable"), per spec.md §9's design note preferring a Rust trait object
//! to a C-style function-pointer table. Grounded on
//! `original_source/user/tests/btree.c`'s `btree_write`/`btree_chop`/
//! `insert_leaf` test harness (entries_per_node, depth bookkeeping) and on
//! the teacher crate's iterator-driven `BtreeIter`/`for_each` style for
//! the cursor-walking loops in [`chop`].
//!
//! Scope note (see DESIGN.md): `insert_leaf` and `chop` assume every
//! buffer on the cursor's path is already owned by the current delta —
//! i.e. [`cursor_redirect`] has already run if COW semantics are needed.
//! This matches the spec's own sequencing ("Cursor-redirect (COW)...
//! Uses: after-probe mutation in COW mode"): redirect is a distinct,
//! earlier step, not something these mutators perform ad hoc mid-edit.

use log::debug;

use crate::balloc::Balloc;
use crate::buffer::{AddressSpace, BufferCache};
use crate::cursor::{cursor_advance, probe as cursor_probe, Cursor, Frame};
use crate::error::{Result, TuxError};
use crate::fork::ForkRegistry;
use crate::node_codec::{NodeEntry, NodeRecord};
use crate::types::{BlockT, BtreeRoot, TuxkeyT, TUXKEY_LIMIT};

/// Outcome of a leaf's `write` callback (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Done,
    /// Continue on the next leaf via cursor-advance.
    Retry,
    /// The current leaf is full; the generic code must split it.
    Split,
}

/// The leaf-ops capability set consumed by the generic B-tree (spec.md
/// §6's "Leaf-ops vtable"). Leaves are opaque byte buffers to this module
/// — every method works on raw bytes, never a concrete leaf type.
pub trait LeafOps {
    type WriteReq;
    type ReadReq;

    /// `init`: produce an empty leaf's on-disk bytes.
    fn init(blocksize: usize) -> Vec<u8>;
    /// `sniff`: quick structural validity check.
    fn sniff(bytes: &[u8]) -> bool;
    /// Minimum key present, or `None` if the leaf holds nothing.
    fn min_key(bytes: &[u8]) -> Option<TuxkeyT>;
    /// `can_free`: true if the leaf holds nothing live.
    fn can_free(bytes: &[u8]) -> bool;
    /// `split`: move the upper half of `bytes` into a freshly sized
    /// sibling, returning the sibling's bytes and its separator key.
    fn split(bytes: &mut Vec<u8>, blocksize: usize) -> (Vec<u8>, TuxkeyT);
    /// `merge`: fold `from` into `into` if the combination fits; `false`
    /// leaves both untouched.
    fn merge(into: &mut Vec<u8>, from: &[u8], blocksize: usize) -> bool;
    /// `chop(start, len)`: remove `[start, start+len)`, returning freed
    /// `(block, count)` pairs for the caller to hand to `seg_free`.
    fn chop(bytes: &mut Vec<u8>, start: TuxkeyT, stop: TuxkeyT) -> Vec<(BlockT, u32)>;
    /// `write(req)`: attempt to satisfy `req` against this leaf.
    fn write(bytes: &mut Vec<u8>, blocksize: usize, req: &mut Self::WriteReq) -> Result<WriteStatus>;
    /// `read(req)`: fill `req` from this leaf's existing mapping.
    fn read(bytes: &[u8], req: &mut Self::ReadReq);
}

/// A generic B-tree bound to one address space (for its nodes/leaves) and
/// one allocator. `O` selects the leaf representation.
pub struct Btree<'a, A: AddressSpace, O: LeafOps, B: Balloc> {
    pub cache: &'a BufferCache<A>,
    pub forks: &'a ForkRegistry,
    pub balloc: &'a B,
    pub blocksize: usize,
    pub entries_per_node: usize,
    _ops: std::marker::PhantomData<O>,
}

impl<'a, A: AddressSpace, O: LeafOps, B: Balloc> Btree<'a, A, O, B> {
    pub fn new(cache: &'a BufferCache<A>, forks: &'a ForkRegistry, balloc: &'a B, blocksize: usize) -> Self {
        Btree {
            cache,
            forks,
            balloc,
            blocksize,
            entries_per_node: crate::node_codec::entries_per_node(blocksize),
            _ops: std::marker::PhantomData,
        }
    }

    /// As [`Btree::new`], but with an explicit `entries_per_node` instead
    /// of the one `node_codec` derives from `blocksize` — for test
    /// harnesses pinning a specific fan-out regardless of leaf format.
    pub fn with_entries_per_node(
        cache: &'a BufferCache<A>,
        forks: &'a ForkRegistry,
        balloc: &'a B,
        blocksize: usize,
        entries_per_node: usize,
    ) -> Self {
        Btree { cache, forks, balloc, blocksize, entries_per_node, _ops: std::marker::PhantomData }
    }

    /// As [`Btree::new`], but taking the tunables from a [`crate::Config`]
    /// a host derived once for the whole volume rather than recomputing
    /// `entries_per_node` from `blocksize` at every call site.
    pub fn with_config(
        cache: &'a BufferCache<A>,
        forks: &'a ForkRegistry,
        balloc: &'a B,
        config: crate::Config,
    ) -> Self {
        Self::with_entries_per_node(cache, forks, balloc, config.blocksize, config.entries_per_node)
    }

    /// Allocate a fresh, empty tree: a single leaf at depth 1.
    pub fn alloc_empty(&self, delta: u32) -> Result<BtreeRoot> {
        let block = self.balloc.alloc_one()?;
        let buf = self.cache.get(block);
        *buf.write_data() = O::init(self.blocksize);
        self.cache.dirty(&buf, delta);
        Ok(BtreeRoot { depth: 1, block, direct: false, direct_block: 0, direct_count: 0 })
    }

    pub fn probe(&self, root: BtreeRoot, key: TuxkeyT) -> Result<Cursor> {
        cursor_probe(self.cache, root, key)
    }

    fn write_node(&self, frame: &mut Frame, rec: NodeRecord, delta: u32) -> Result<()> {
        if frame.buffer.needs_fork(delta) {
            return Err(TuxError::Invariant(format!(
                "attempted to mutate node {} still owned by a prior delta; cursor_redirect first",
                frame.buffer.index
            )));
        }
        *frame.buffer.write_data() = rec.encode(self.blocksize);
        self.cache.dirty(&frame.buffer, delta);
        frame.node = Some(rec);
        Ok(())
    }

    /// `cursor-redirect` (spec.md §4.4): rewrite path frames from
    /// `from_level` downward so each is a freshly allocated, current-delta
    /// buffer, updating parent child pointers (or the root block) as it
    /// goes. Frames above `from_level` are left untouched.
    pub fn cursor_redirect(
        &self,
        cursor: &mut Cursor,
        root: &mut BtreeRoot,
        from_level: usize,
        delta: u32,
    ) -> Result<()> {
        for level in from_level..cursor.path.len() {
            let buf = cursor.path[level].buffer.clone();
            if !buf.needs_fork(delta) {
                continue;
            }
            let new_block = self.balloc.alloc_one()?;
            let forked = self.forks.fork(self.cache, &buf, delta, new_block)?;

            if level > 0 {
                let parent_level = level - 1;
                let idx = cursor.path[parent_level].next_entry - 1;
                let mut prec = cursor.path[parent_level]
                    .node
                    .clone()
                    .expect("non-leaf ancestor must carry a node record");
                prec.entries[idx].child = forked.index;
                self.write_node(&mut cursor.path[parent_level], prec, delta)?;
            } else {
                root.block = forked.index;
            }
            cursor.path[level].buffer = forked;
            debug!("redirected level {level} from block {} to {}", buf.index, cursor.path[level].buffer.index);
        }
        Ok(())
    }

    fn grow_root(
        &self,
        root: &mut BtreeRoot,
        cursor: &mut Cursor,
        delta: u32,
        left_block: BlockT,
        sep_key: TuxkeyT,
        right_block: BlockT,
        path_is_left: bool,
    ) -> Result<()> {
        let new_root_block = self.balloc.alloc_one()?;
        let rec = NodeRecord {
            entries: vec![
                NodeEntry { key: 0, child: left_block },
                NodeEntry { key: sep_key, child: right_block },
            ],
        };
        let buf = self.cache.get(new_root_block);
        *buf.write_data() = rec.encode(self.blocksize);
        self.cache.dirty(&buf, delta);

        root.block = new_root_block;
        root.depth += 1;
        let next_entry = if path_is_left { 1 } else { 2 };
        cursor.path.insert(0, Frame { buffer: buf, next_entry, node: Some(rec) });
        cursor.set_tree_depth(root.depth);
        Ok(())
    }

    /// `insert-leaf` (spec.md §4.4): insert `(sep_key, new_child)` as the
    /// separator for a freshly split-off sibling, splitting ancestors (and
    /// growing the tree) as needed. The cursor remains positioned at the
    /// same logical leaf afterward.
    pub fn insert_leaf(
        &self,
        root: &mut BtreeRoot,
        cursor: &mut Cursor,
        delta: u32,
        mut sep_key: TuxkeyT,
        mut new_child: BlockT,
    ) -> Result<()> {
        if cursor.path.len() < 2 {
            let old_block = cursor.path[0].buffer.index;
            return self.grow_root(root, cursor, delta, old_block, sep_key, new_child, true);
        }

        let mut level = cursor.path.len() - 2;
        loop {
            let insert_at = cursor.path[level].next_entry;
            let mut rec = cursor.path[level].node.clone().expect("internal frame");
            rec.entries.insert(insert_at, NodeEntry { key: sep_key, child: new_child });

            if rec.entries.len() <= self.entries_per_node {
                cursor.path[level].next_entry = insert_at;
                self.write_node(&mut cursor.path[level], rec, delta)?;
                return Ok(());
            }

            let mid = rec.entries.len() / 2;
            let right_entries = rec.entries.split_off(mid);
            let sibling_sep = right_entries[0].key;
            let right_rec = NodeRecord { entries: right_entries };

            let left_buf = cursor.path[level].buffer.clone();
            if left_buf.needs_fork(delta) {
                return Err(TuxError::Invariant(format!(
                    "node {} needs fork before insert_leaf; cursor_redirect first",
                    left_buf.index
                )));
            }
            *left_buf.write_data() = rec.encode(self.blocksize);
            self.cache.dirty(&left_buf, delta);

            let new_block = self.balloc.alloc_one()?;
            let right_buf = self.cache.get(new_block);
            *right_buf.write_data() = right_rec.encode(self.blocksize);
            self.cache.dirty(&right_buf, delta);

            let used_idx = insert_at - 1;
            let path_is_left = used_idx < mid;
            if path_is_left {
                cursor.path[level].node = Some(rec);
                cursor.path[level].next_entry = used_idx + 1;
            } else {
                let local = used_idx - mid;
                cursor.path[level].buffer = right_buf.clone();
                cursor.path[level].node = Some(right_rec.clone());
                cursor.path[level].next_entry = local + 1;
            }

            if level == 0 {
                return self.grow_root(root, cursor, delta, left_buf.index, sibling_sep, new_block, path_is_left);
            }
            sep_key = sibling_sep;
            new_child = new_block;
            level -= 1;
        }
    }

    /// `adjust-parent-sep` (spec.md §4.4): after a chop changes a leaf's
    /// minimum key, fix up the nearest ancestor separator that encodes it
    /// — the first ancestor level where the leaf wasn't reached via the
    /// (ignored) left-fence entry.
    fn adjust_parent_sep(&self, cursor: &mut Cursor, new_min: TuxkeyT, delta: u32) -> Result<()> {
        if cursor.path.len() < 2 {
            return Ok(());
        }
        let mut level = cursor.path.len() - 2;
        loop {
            let used_idx = cursor.path[level].next_entry - 1;
            if used_idx == 0 {
                if level == 0 {
                    return Ok(());
                }
                level -= 1;
                continue;
            }
            let mut rec = cursor.path[level].node.clone().expect("internal frame");
            if rec.entries[used_idx].key == new_min {
                return Ok(());
            }
            rec.entries[used_idx].key = new_min;
            self.write_node(&mut cursor.path[level], rec, delta)?;
            return Ok(());
        }
    }

    /// Discard whatever frame is on top of `cursor`, removing its
    /// reference from its parent and cascading upward through empty
    /// ancestors; collapses the root by one level (or to an empty leaf)
    /// when appropriate (spec.md §4.4's "empty internal nodes cascade-free
    /// and shrink tree depth").
    ///
    /// Returns `true` when the root collapsed onto a surviving subtree
    /// that this call didn't visit — the cursor is left empty even though
    /// the tree isn't, and the caller must re-probe to keep going. Returns
    /// `false` when the cursor's emptiness (if any) means the tree itself
    /// has nothing left.
    fn remove_current_and_cascade(&self, cursor: &mut Cursor, root: &mut BtreeRoot, delta: u32) -> Result<bool> {
        loop {
            if cursor.path.len() <= 1 {
                let leaf_buf = cursor.path[0].buffer.clone();
                *leaf_buf.write_data() = O::init(self.blocksize);
                self.cache.dirty(&leaf_buf, delta);
                cursor.path.pop();
                return Ok(false);
            }

            let level = cursor.path.len() - 2;
            let used_idx = cursor.path[level].next_entry - 1;
            let mut rec = cursor.path[level].node.clone().expect("internal frame");
            rec.entries.remove(used_idx);
            cursor.path[level].next_entry = used_idx;
            cursor.path.pop();

            if rec.entries.is_empty() {
                if level == 0 {
                    let root_buf = cursor.path[0].buffer.clone();
                    *root_buf.write_data() = O::init(self.blocksize);
                    self.cache.dirty(&root_buf, delta);
                    root.depth = 1;
                    cursor.set_tree_depth(1);
                    return Ok(false);
                }
                let node_block = cursor.path[level].buffer.index;
                self.balloc.defer_bfree(node_block, 1);
                self.balloc.log_bfree(node_block, 1);
                continue;
            } else if level == 0 && rec.entries.len() == 1 {
                let old_root_block = cursor.path[0].buffer.index;
                root.block = rec.entries[0].child;
                root.depth -= 1;
                cursor.path.remove(0);
                cursor.set_tree_depth(root.depth);
                self.balloc.defer_bfree(old_root_block, 1);
                self.balloc.log_bfree(old_root_block, 1);
                return Ok(true);
            } else {
                self.write_node(&mut cursor.path[level], rec, delta)?;
                return Ok(false);
            }
        }
    }

    /// `chop(tree, start, len)` (spec.md §4.4): remove every key in
    /// `[start, start+len)` (or to the end, if `len == TUXKEY_LIMIT`).
    /// Returns freed `(block, count)` extents.
    pub fn chop(&self, root: &mut BtreeRoot, start: TuxkeyT, len: TuxkeyT, delta: u32) -> Result<Vec<(BlockT, u32)>> {
        if root.depth == 0 {
            return Ok(Vec::new());
        }
        let stop = if len == TUXKEY_LIMIT { TUXKEY_LIMIT } else { start.saturating_add(len) };

        let mut freed = Vec::new();
        let mut cursor = self.probe(*root, start)?;

        // Tracks the previous surviving (non-empty) leaf, for same-parent
        // merge attempts, alongside its parent buffer's identity.
        let mut prev: Option<(u64, Vec<u8>, Option<u64>)> = None;

        loop {
            let leaf_index = cursor.leaf().index;
            let parent_index = if cursor.path.len() >= 2 {
                Some(cursor.path[cursor.path.len() - 2].buffer.index)
            } else {
                None
            };
            let mut bytes = cursor.leaf().read_data().clone();
            freed.extend(O::chop(&mut bytes, start, stop));

            let mut collapsed = false;
            if O::can_free(&bytes) {
                collapsed = self.remove_current_and_cascade(&mut cursor, root, delta)?;
                self.balloc.defer_bfree(leaf_index, 1);
                self.balloc.log_bfree(leaf_index, 1);
                freed.push((leaf_index, 1));
            } else {
                let mut merged = false;
                if let Some((prev_index, mut prev_bytes, prev_parent)) = prev.take() {
                    if prev_parent == parent_index && O::merge(&mut prev_bytes, &bytes, self.blocksize) {
                        let prev_buf = self.cache.peek(prev_index).expect("previously processed leaf must be cached");
                        if prev_buf.needs_fork(delta) {
                            return Err(TuxError::Invariant(format!(
                                "leaf {prev_index} needs fork before merge; cursor_redirect first"
                            )));
                        }
                        *prev_buf.write_data() = prev_bytes.clone();
                        self.cache.dirty(&prev_buf, delta);

                        collapsed = self.remove_current_and_cascade(&mut cursor, root, delta)?;
                        self.balloc.defer_bfree(leaf_index, 1);
                        self.balloc.log_bfree(leaf_index, 1);
                        freed.push((leaf_index, 1));

                        prev = Some((prev_index, prev_bytes, prev_parent));
                        merged = true;
                    } else {
                        prev = Some((prev_index, prev_bytes, prev_parent));
                    }
                }
                if !merged {
                    let leaf_buf = cursor.leaf().clone();
                    if leaf_buf.needs_fork(delta) {
                        return Err(TuxError::Invariant(format!(
                            "leaf {leaf_index} needs fork before chop; cursor_redirect first"
                        )));
                    }
                    if let Some(new_min) = O::min_key(&bytes) {
                        self.adjust_parent_sep(&mut cursor, new_min, delta)?;
                    }
                    *leaf_buf.write_data() = bytes.clone();
                    self.cache.dirty(&leaf_buf, delta);
                    prev = Some((leaf_index, bytes, parent_index));
                }
            }

            if collapsed {
                // The root just shrank by a level; the cursor was left
                // empty even though a surviving subtree may still hold
                // leaves this pass hasn't reached yet. Re-probe from
                // `start` to pick the walk back up on the new root, and
                // drop `prev` since the parent it was keyed on is gone.
                // The re-probed leaf hasn't been processed yet, so go
                // straight back to the top rather than advancing past it.
                prev = None;
                if root.depth == 0 {
                    break;
                }
                cursor = self.probe(*root, start)?;
                continue;
            }

            if cursor.is_empty_tree() {
                break;
            }
            if !cursor_advance(self.cache, &mut cursor)? {
                break;
            }
            if stop != TUXKEY_LIMIT {
                let next_bytes = cursor.leaf().read_data().clone();
                if let Some(min) = O::min_key(&next_bytes) {
                    if min >= stop {
                        break;
                    }
                }
            }
        }
        Ok(freed)
    }
}
