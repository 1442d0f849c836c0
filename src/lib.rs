//! Delta-batched copy-on-write B-tree storage core.
//!
//! This crate implements the generic, on-disk-format-agnostic substrate of
//! a tux3-style versioned file system: a delta-tagged buffer cache (C1), a
//! copy-on-write buffer-fork mechanism (C2), B-tree cursors and paths (C3),
//! generic B-tree node operations (C4), a data-leaf extent container (C5),
//! and the file-map algorithm that ties them together (C6). Mounting,
//! on-disk superblock management, and any particular frontend (FUSE, CLI,
//! network protocol) are all out of scope — this crate only does the
//! allocation-and-mapping core, leaning on an external [`balloc::Balloc`]
//! for free-space bookkeeping.

pub mod balloc;
pub mod btree;
pub mod buffer;
pub mod cursor;
pub mod delta;
pub mod dleaf;
pub mod error;
pub mod filemap;
pub mod fork;
pub mod node_codec;
pub mod types;

pub use balloc::{Balloc, VecBalloc};
pub use btree::{Btree, LeafOps, WriteStatus};
pub use buffer::{AddressSpace, Buffer, BufferCache};
pub use cursor::{cursor_advance, leaf_upper_bound, probe, Cursor, Frame};
pub use delta::DeltaCounter;
pub use dleaf::{Dleaf, DleafReadReq, DleafRecord, DleafWriteReq};
pub use error::{Result, TuxError};
pub use filemap::Filemap;
pub use fork::ForkRegistry;
pub use node_codec::{NodeEntry, NodeRecord};
pub use types::{
    BlockT, BtreeRoot, Extent, MapMode, SegState, Segment, TuxkeyT, BLOCK_MASK, MAX_DELTA, MAX_DIRECT_COUNT,
    TUXKEY_LIMIT,
};

/// Runtime-tunable parameters a host (the inode layer, a mount, a test
/// harness) supplies once and shares across every tree it opens. Kept as
/// plain fields rather than a builder — every field is mandatory and has
/// no sane crate-wide default, since it's derived from the on-disk format
/// a given volume was created with.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Block size in bytes; every buffer, node, and leaf is exactly this
    /// size.
    pub blocksize: usize,
    /// Entries a single internal node can hold before it must split.
    /// Derived from `blocksize` via [`node_codec::entries_per_node`], but
    /// kept alongside it so callers don't recompute it on every probe.
    pub entries_per_node: usize,
    /// Largest logical extent length the root descriptor can hold
    /// directly, bypassing a real B-tree.
    pub max_direct_count: u32,
    /// Maximum number of deltas in flight at once.
    pub max_delta: u32,
}

impl Config {
    pub fn new(blocksize: usize) -> Self {
        Config {
            blocksize,
            entries_per_node: node_codec::entries_per_node(blocksize),
            max_direct_count: types::MAX_DIRECT_COUNT,
            max_delta: types::MAX_DELTA,
        }
    }
}
