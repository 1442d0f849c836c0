//! On-disk layout codecs (spec.md §6).
//!
//! The node header/entry layout and the inode root descriptor are both
//! fixed-width big-endian records. Pure-Rust getter/setter helpers, in the
//! spirit of the teacher's `bitmask.rs` LE64-bitmask accessors — there the
//! packed fields were little-endian bitfields inside a generated C struct;
//! here they're big-endian byte records we own outright, so plain
//! `byteorder` read/write calls replace the bit-shift helpers.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};

use crate::types::{BlockT, BtreeRoot, TuxkeyT, BLOCK_MASK};

/// `(key: u64, block: u64)` big-endian, per spec.md §6.
pub const NODE_ENTRY_BYTES: usize = 16;

/// Fixed node header: `{count: u16, ...padding...}`.
pub const NODE_HEADER_BYTES: usize = 8;

/// Number of entries a node of `blocksize` bytes can hold.
pub fn entries_per_node(blocksize: usize) -> usize {
    (blocksize - NODE_HEADER_BYTES) / NODE_ENTRY_BYTES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub key: TuxkeyT,
    pub child: BlockT,
}

/// Decoded form of a persisted internal node (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub entries: Vec<NodeEntry>,
}

impl NodeRecord {
    pub fn encode(&self, blocksize: usize) -> Vec<u8> {
        let mut buf = vec![0u8; blocksize];
        let mut cur = Cursor::new(&mut buf[..]);
        cur.write_u16::<BigEndian>(self.entries.len() as u16).unwrap();
        cur.write_u16::<BigEndian>(0).unwrap();
        cur.write_u32::<BigEndian>(0).unwrap();
        for e in &self.entries {
            cur.write_u64::<BigEndian>(e.key).unwrap();
            cur.write_u64::<BigEndian>(e.child & BLOCK_MASK).unwrap();
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(bytes);
        let count = cur.read_u16::<BigEndian>()?;
        let _pad16 = cur.read_u16::<BigEndian>()?;
        let _pad32 = cur.read_u32::<BigEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = cur.read_u64::<BigEndian>()?;
            let child = cur.read_u64::<BigEndian>()? & BLOCK_MASK;
            entries.push(NodeEntry { key, child });
        }
        Ok(NodeRecord { entries })
    }
}

/// Encode the inode root descriptor: packed `depth:16 || block:48`, BE.
pub fn encode_root(root: &BtreeRoot) -> [u8; 8] {
    let mut out = [0u8; 8];
    let mut w = &mut out[..];
    let packed = ((root.depth as u64) << 48) | (root.block & BLOCK_MASK);
    w.write_u64::<BigEndian>(packed).unwrap();
    out
}

/// Decode the inode root descriptor produced by [`encode_root`].
pub fn decode_root(bytes: &[u8; 8]) -> BtreeRoot {
    let mut r = &bytes[..];
    let packed = r.read_u64::<BigEndian>().unwrap();
    let depth = (packed >> 48) as u16;
    let block = packed & BLOCK_MASK;
    BtreeRoot { depth, block, direct: false, direct_block: 0, direct_count: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_round_trips() {
        let rec = NodeRecord {
            entries: vec![
                NodeEntry { key: 0, child: 5 },
                NodeEntry { key: 10, child: 42 },
            ],
        };
        let bytes = rec.encode(128);
        let decoded = NodeRecord::decode(&bytes).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn root_round_trips() {
        let root = BtreeRoot { depth: 3, block: 0xFFFF_FFFF_FFFF, direct: false, direct_block: 0, direct_count: 0 };
        let bytes = encode_root(&root);
        let decoded = decode_root(&bytes);
        assert_eq!(decoded.depth, 3);
        assert_eq!(decoded.block, 0xFFFF_FFFF_FFFF);
    }
}
