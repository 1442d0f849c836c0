//! Core data types shared by every component (spec.md §3).

/// Physical block number. Only the low 48 bits are significant on disk;
/// the wider Rust type avoids a narrow newtype wrapper everywhere arithmetic
/// on block numbers is needed.
pub type BlockT = u64;

/// Mask applied when persisting a [`BlockT`]; storage is 48-bit.
pub const BLOCK_MASK: u64 = (1u64 << 48) - 1;

/// Logical key into a file's B-tree (a logical block index).
pub type TuxkeyT = u64;

/// Sentinel meaning "to the end of the key space", used by `chop` and by
/// direct-extent eligibility checks.
pub const TUXKEY_LIMIT: TuxkeyT = u64::MAX;

/// Maximum number of deltas in flight at once (frontend + backend +
/// in-progress flush). Bounds the width of the delta tag packed into the
/// buffer state word.
pub const MAX_DELTA: u32 = 3;

/// The distinguished "no delta" slot a cleared buffer's tag is set to.
/// One more than `MAX_DELTA` so it never collides with a live delta number.
pub const BUFDELTA_AVAIL: u32 = MAX_DELTA + 1;

/// Largest logical extent length the root descriptor can hold directly,
/// bypassing a real B-tree (spec.md §3, "Direct extent").
pub const MAX_DIRECT_COUNT: u32 = 1 << 6;

/// State of one mapped extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegState {
    /// Backed by existing physical blocks.
    Mapped,
    /// No physical backing; reads return zero.
    Hole,
    /// Freshly allocated by this operation; caller must initialize contents.
    NewlyAllocated,
}

/// A contiguous run of logical blocks mapped to physical storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub block: BlockT,
    pub count: u32,
    pub state: SegState,
}

impl Extent {
    pub fn new(block: BlockT, count: u32, state: SegState) -> Self {
        Extent { block, count, state }
    }

    pub fn hole(count: u32) -> Self {
        Extent { block: 0, count, state: SegState::Hole }
    }
}

/// A physical segment of a logical range, handed between the file-map and
/// the data-leaf write/read callbacks. Distinct from [`Extent`] in that a
/// segment always carries the logical key it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub key: TuxkeyT,
    pub block: BlockT,
    pub count: u32,
    pub state: SegState,
}

/// Mode under which `filemap` is invoked (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
    Redirect,
}

/// Root descriptor of a B-tree, owned by the inode (external to this core,
/// but modeled here since C4/C6 read and rewrite it).
///
/// `depth == 0` means "no real tree" — either empty, or a direct extent is
/// stored in `direct_block`/`direct_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeRoot {
    pub depth: u16,
    pub block: BlockT,
    pub direct: bool,
    pub direct_block: BlockT,
    pub direct_count: u32,
}

impl BtreeRoot {
    pub fn empty() -> Self {
        BtreeRoot { depth: 0, block: 0, direct: false, direct_block: 0, direct_count: 0 }
    }
}
