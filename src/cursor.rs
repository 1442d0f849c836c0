//! Cursor & path (spec.md §4.3, component C3).
//!
//! A path from B-tree root to leaf. Probe only needs to walk internal
//! nodes — the leaf itself stays opaque to this module, per spec.md §3
//! ("Leaves are opaque to the generic B-tree").
//!
//! Depth convention: `BtreeRoot.depth` counts total tree height *including*
//! the leaf level (root-as-leaf ⇒ depth 1), matching
//! `original_source/user/tests/btree.c`'s `alloc_empty_btree` (depth 1 for
//! an empty tree) and spec.md §8's seed-scenario numbers (depth 2 after
//! growth, depth 1 after a full chop). Under this convention
//! `path.len() == depth` exactly, rather than `depth + 1` — see DESIGN.md's
//! Open Question resolution for why this departs from the literal phrasing
//! of spec.md §3.

use std::sync::Arc;

use crate::buffer::{AddressSpace, Buffer, BufferCache};
use crate::error::{Result, TuxError};
use crate::node_codec::NodeRecord;
use crate::types::{BtreeRoot, TuxkeyT};

/// One level of a cursor's path. `node` holds the decoded internal-node
/// record for every level above the leaf; the leaf frame's `node` is
/// `None` since leaf layout is opaque here.
pub struct Frame {
    pub buffer: Arc<Buffer>,
    pub next_entry: usize,
    pub node: Option<NodeRecord>,
}

/// A stack of frames from root to leaf, plus the tree height it was probed
/// against (needed by [`cursor_advance`] to know when a descent reaches
/// the leaf level).
pub struct Cursor {
    pub path: Vec<Frame>,
    tree_depth: u16,
}

impl Cursor {
    /// `alloc_cursor(tree, extra_depth)`: reserves room for a path that can
    /// grow by `extra_depth` levels (e.g. a single insert that splits the
    /// root) without reallocating.
    pub fn alloc(depth: u16, extra_depth: u16) -> Cursor {
        Cursor { path: Vec::with_capacity(depth as usize + extra_depth as usize), tree_depth: depth }
    }

    pub fn tree_depth(&self) -> u16 {
        self.tree_depth
    }

    pub fn set_tree_depth(&mut self, depth: u16) {
        self.tree_depth = depth;
    }

    pub fn leaf(&self) -> &Arc<Buffer> {
        &self.path.last().expect("cursor has no frames").buffer
    }

    pub fn is_empty_tree(&self) -> bool {
        self.path.is_empty()
    }

    /// `release_cursor`: drops buffer pins from top (leaf) to bottom (root).
    pub fn release(&mut self) {
        while self.path.pop().is_some() {}
    }

    /// `cursor_check` (debug): validates separator monotonicity along the
    /// path (spec.md §4.4 invariant (a), restricted to what's visible from
    /// a single path rather than the whole tree).
    pub fn check(&self) -> Result<()> {
        for frame in &self.path {
            if let Some(rec) = &frame.node {
                // entries[0] is the left fence; strict monotonicity is
                // only required from entries[1] onward.
                if rec.entries.len() > 2 {
                    for w in rec.entries[1..].windows(2) {
                        if w[1].key <= w[0].key {
                            return Err(TuxError::Invariant(format!(
                                "node entries not strictly increasing: {} >= {}",
                                w[0].key, w[1].key
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode_node(buffer: &Buffer) -> Result<NodeRecord> {
    NodeRecord::decode(&buffer.read_data())
        .map_err(|e| TuxError::Corruption(format!("node sniff failed: {e}")))
}

/// Largest index `i` such that `entries[i].key <= key`, treating
/// `entries[0]` as a left fence that always matches (spec.md §3: "The
/// first entry's separator is ignored").
fn largest_le(entries: &[crate::node_codec::NodeEntry], key: TuxkeyT) -> usize {
    let mut lo = 0usize;
    let mut hi = entries.len();
    // Binary search for the largest index with entries[i].key <= key,
    // entries[0] always counts as a match regardless of its stored key.
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if entries[mid].key <= key {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// `probe(cursor, key)`: reads the root, then descends internal nodes via
/// binary search for the largest separator `<= key`, terminating with the
/// leaf on top of the path. Returns an empty-path cursor if `root.depth ==
/// 0` (no tree).
pub fn probe<A: AddressSpace>(
    cache: &BufferCache<A>,
    root: BtreeRoot,
    key: TuxkeyT,
) -> Result<Cursor> {
    let mut cursor = Cursor::alloc(root.depth, 1);
    if root.depth == 0 {
        return Ok(cursor);
    }

    let mut block = root.block;
    for _level in (1..root.depth).rev() {
        let buf = cache.read(block)?;
        let rec = decode_node(&buf)?;
        let idx = largest_le(&rec.entries, key);
        let child = rec.entries[idx].child;
        cursor.path.push(Frame { buffer: buf, next_entry: idx + 1, node: Some(rec) });
        block = child;
    }

    let leafbuf = cache.read(block)?;
    cursor.path.push(Frame { buffer: leafbuf, next_entry: 0, node: None });
    Ok(cursor)
}

/// `cursor_advance(cursor)`: pops until a frame has a next entry, then
/// descends leftmost from there to a new leaf. `Ok(false)` when there are
/// no more leaves to visit.
pub fn cursor_advance<A: AddressSpace>(cache: &BufferCache<A>, cursor: &mut Cursor) -> Result<bool> {
    while let Some(frame) = cursor.path.last() {
        match &frame.node {
            Some(rec) if frame.next_entry < rec.entries.len() => break,
            Some(_) => {
                cursor.path.pop();
            }
            None => {
                // leaf frame with nothing above it that has a next entry
                cursor.path.pop();
            }
        }
    }
    if cursor.path.is_empty() {
        return Ok(false);
    }

    loop {
        let (child, reached_leaf) = {
            let frame = cursor.path.last_mut().expect("checked non-empty above");
            let rec = frame.node.as_ref().expect("non-leaf frame must carry a node record");
            let child = rec.entries[frame.next_entry].child;
            frame.next_entry += 1;
            (child, cursor.path.len() + 1 == cursor.tree_depth as usize)
        };
        let buf = cache.read(child)?;
        if reached_leaf {
            cursor.path.push(Frame { buffer: buf, next_entry: 0, node: None });
            break;
        } else {
            let rec = decode_node(&buf)?;
            cursor.path.push(Frame { buffer: buf, next_entry: 0, node: Some(rec) });
        }
    }
    Ok(true)
}

/// Exclusive upper bound of the key range the leaf currently on top of
/// `cursor` can hold, derived from the nearest ancestor separator that
/// lies to its right. `TUXKEY_LIMIT` if the leaf is the tree's rightmost.
pub fn leaf_upper_bound(cursor: &Cursor) -> TuxkeyT {
    if cursor.path.len() < 2 {
        return crate::types::TUXKEY_LIMIT;
    }
    for level in (0..cursor.path.len() - 1).rev() {
        let frame = &cursor.path[level];
        let rec = frame.node.as_ref().expect("non-leaf frame must carry a node record");
        if frame.next_entry < rec.entries.len() {
            return rec.entries[frame.next_entry].key;
        }
    }
    crate::types::TUXKEY_LIMIT
}
