//! Data-leaf extent container (spec.md §4.5, component C5).
//!
//! The concrete [`LeafOps`](crate::btree::LeafOps) implementation storing a
//! sorted run of `(logical key, extent)` pairs per leaf — tux3's dleaf.
//! Layout mirrors `node_codec`'s fixed-width big-endian records (same
//! header shape, different entry payload), grounded on
//! `original_source/user/kernel/filemap.c`'s segment/extent modeling
//! (`struct seg`, `SEG_HOLE`/`SEG_NEW` state bits become [`SegState`]).

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor as IoCursor};

use crate::btree::{LeafOps, WriteStatus};
use crate::error::Result;
use crate::types::{BlockT, Extent, SegState, Segment, TuxkeyT, BLOCK_MASK};

const HEADER_BYTES: usize = 8;
const ENTRY_BYTES: usize = 24; // key:8, block:8 (48 bits + 8-bit state), count:4, pad:4

pub fn entries_per_leaf(blocksize: usize) -> usize {
    (blocksize - HEADER_BYTES) / ENTRY_BYTES
}

fn state_to_tag(state: SegState) -> u8 {
    match state {
        SegState::Mapped => 0,
        SegState::Hole => 1,
        SegState::NewlyAllocated => 2,
    }
}

fn tag_to_state(tag: u8) -> SegState {
    match tag {
        1 => SegState::Hole,
        2 => SegState::NewlyAllocated,
        _ => SegState::Mapped,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DleafEntry {
    pub key: TuxkeyT,
    pub extent: Extent,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DleafRecord {
    pub entries: Vec<DleafEntry>,
}

impl DleafRecord {
    pub fn encode(&self, blocksize: usize) -> Vec<u8> {
        let mut buf = vec![0u8; blocksize];
        let mut cur = IoCursor::new(&mut buf[..]);
        cur.write_u16::<BigEndian>(self.entries.len() as u16).unwrap();
        cur.write_u16::<BigEndian>(0).unwrap();
        cur.write_u32::<BigEndian>(0).unwrap();
        for e in &self.entries {
            cur.write_u64::<BigEndian>(e.key).unwrap();
            let packed_block = (e.extent.block & BLOCK_MASK) | ((state_to_tag(e.extent.state) as u64) << 56);
            cur.write_u64::<BigEndian>(packed_block).unwrap();
            cur.write_u32::<BigEndian>(e.extent.count).unwrap();
            cur.write_u32::<BigEndian>(0).unwrap();
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = IoCursor::new(bytes);
        let count = cur.read_u16::<BigEndian>()?;
        let _ = cur.read_u16::<BigEndian>()?;
        let _ = cur.read_u32::<BigEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = cur.read_u64::<BigEndian>()?;
            let packed_block = cur.read_u64::<BigEndian>()?;
            let count = cur.read_u32::<BigEndian>()?;
            let _pad = cur.read_u32::<BigEndian>()?;
            let state = tag_to_state((packed_block >> 56) as u8);
            let block = packed_block & BLOCK_MASK;
            entries.push(DleafEntry { key, extent: Extent { block, count, state } });
        }
        Ok(DleafRecord { entries })
    }

    /// Remove (or trim) whatever overlaps `[key, key+count)`, leaving the
    /// remaining entries in sorted, non-overlapping order.
    fn punch(&mut self, key: TuxkeyT, count: u32) {
        let stop = key.saturating_add(count as u64);
        let mut out = Vec::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            let e_stop = e.key.saturating_add(e.extent.count as u64);
            if e_stop <= key || e.key >= stop {
                out.push(e);
                continue;
            }
            if e.key < key {
                out.push(DleafEntry {
                    key: e.key,
                    extent: Extent { block: e.extent.block, count: (key - e.key) as u32, state: e.extent.state },
                });
            }
            if e_stop > stop {
                let tail_block = if e.extent.state == SegState::Hole { 0 } else { e.extent.block + (stop - e.key) };
                out.push(DleafEntry {
                    key: stop,
                    extent: Extent { block: tail_block, count: (e_stop - stop) as u32, state: e.extent.state },
                });
            }
        }
        out.sort_by_key(|e| e.key);
        self.entries = out;
    }

    fn insert_sorted(&mut self, entry: DleafEntry) {
        let pos = self.entries.partition_point(|e| e.key < entry.key);
        self.entries.insert(pos, entry);
    }
}

/// One installment request: map `segments` in order, each replacing
/// whatever currently covers its key range. `segments` shrinks as entries
/// get consumed — [`LeafOps::write`] drains the prefix it managed to fit.
#[derive(Debug, Clone)]
pub struct DleafWriteReq {
    pub segments: Vec<Segment>,
}

/// Request to read `count` logical blocks starting at `key`; `result`
/// accumulates the segments found (holes included) covering that range.
#[derive(Debug, Clone, Default)]
pub struct DleafReadReq {
    pub key: TuxkeyT,
    pub count: u32,
    pub result: Vec<Segment>,
}

pub struct Dleaf;

impl LeafOps for Dleaf {
    type WriteReq = DleafWriteReq;
    type ReadReq = DleafReadReq;

    fn init(blocksize: usize) -> Vec<u8> {
        DleafRecord::default().encode(blocksize)
    }

    fn sniff(bytes: &[u8]) -> bool {
        DleafRecord::decode(bytes).is_ok()
    }

    fn min_key(bytes: &[u8]) -> Option<TuxkeyT> {
        DleafRecord::decode(bytes).ok().and_then(|r| r.entries.first().map(|e| e.key))
    }

    fn can_free(bytes: &[u8]) -> bool {
        DleafRecord::decode(bytes).map(|r| r.entries.is_empty()).unwrap_or(true)
    }

    fn split(bytes: &mut Vec<u8>, blocksize: usize) -> (Vec<u8>, TuxkeyT) {
        let mut rec = DleafRecord::decode(bytes).expect("leaf split on corrupt leaf");
        let mid = rec.entries.len() / 2;
        let right_entries = rec.entries.split_off(mid);
        let sep = right_entries[0].key;
        let right = DleafRecord { entries: right_entries };
        *bytes = rec.encode(blocksize);
        (right.encode(blocksize), sep)
    }

    fn merge(into: &mut Vec<u8>, from: &[u8], blocksize: usize) -> bool {
        let mut left = DleafRecord::decode(into).expect("merge on corrupt leaf");
        let right = DleafRecord::decode(from).expect("merge on corrupt leaf");
        if left.entries.len() + right.entries.len() > entries_per_leaf(blocksize) {
            return false;
        }
        left.entries.extend(right.entries);
        left.entries.sort_by_key(|e| e.key);
        *into = left.encode(blocksize);
        true
    }

    fn chop(bytes: &mut Vec<u8>, start: TuxkeyT, stop: TuxkeyT) -> Vec<(BlockT, u32)> {
        let mut rec = DleafRecord::decode(bytes).expect("chop on corrupt leaf");
        let count = if stop == TuxkeyT::MAX { u32::MAX } else { (stop - start) as u32 };
        let mut freed = Vec::new();
        for e in &rec.entries {
            let e_stop = e.key.saturating_add(e.extent.count as u64);
            if e.extent.state != SegState::Hole && e.key < stop && e_stop > start {
                let overlap_start = e.key.max(start);
                let overlap_stop = e_stop.min(stop);
                let overlap_block = e.extent.block + (overlap_start - e.key);
                freed.push((overlap_block, (overlap_stop - overlap_start) as u32));
            }
        }
        rec.punch(start, count);
        *bytes = rec.encode(rec_blocksize(bytes));
        freed
    }

    fn write(bytes: &mut Vec<u8>, blocksize: usize, req: &mut Self::WriteReq) -> Result<WriteStatus> {
        let mut rec = DleafRecord::decode(bytes).expect("write on corrupt leaf");
        let cap = entries_per_leaf(blocksize);
        let mut consumed = 0;
        for seg in &req.segments {
            rec.punch(seg.key, seg.count);
            if rec.entries.len() >= cap {
                break;
            }
            rec.insert_sorted(DleafEntry {
                key: seg.key,
                extent: Extent { block: seg.block, count: seg.count, state: seg.state },
            });
            consumed += 1;
        }
        *bytes = rec.encode(blocksize);
        req.segments.drain(0..consumed);
        if req.segments.is_empty() {
            Ok(WriteStatus::Done)
        } else if consumed > 0 {
            Ok(WriteStatus::Retry)
        } else {
            Ok(WriteStatus::Split)
        }
    }

    fn read(bytes: &[u8], req: &mut Self::ReadReq) {
        let rec = DleafRecord::decode(bytes).unwrap_or_default();
        let stop = req.key.saturating_add(req.count as u64);
        let mut cursor = req.key;
        for e in &rec.entries {
            let e_stop = e.key.saturating_add(e.extent.count as u64);
            if e_stop <= cursor || e.key >= stop {
                continue;
            }
            if e.key > cursor {
                req.result.push(Segment { key: cursor, block: 0, count: (e.key - cursor) as u32, state: SegState::Hole });
            }
            let seg_start = e.key.max(cursor);
            let seg_stop = e_stop.min(stop);
            let seg_block = if e.extent.state == SegState::Hole { 0 } else { e.extent.block + (seg_start - e.key) };
            req.result.push(Segment {
                key: seg_start,
                block: seg_block,
                count: (seg_stop - seg_start) as u32,
                state: e.extent.state,
            });
            cursor = seg_stop;
        }
        if cursor < stop {
            req.result.push(Segment { key: cursor, block: 0, count: (stop - cursor) as u32, state: SegState::Hole });
        }
    }
}

// `chop`'s signature only gets the leaf's raw bytes, not its blocksize —
// the generic encode call needs one, and since every leaf in a tree shares
// one blocksize we can recover it from the buffer length itself.
fn rec_blocksize(bytes: &[u8]) -> usize {
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 256;

    fn seg(key: TuxkeyT, block: BlockT, count: u32) -> Segment {
        Segment { key, block, count, state: SegState::Mapped }
    }

    #[test]
    fn write_then_read_round_trips_a_mapped_extent() {
        let mut bytes = Dleaf::init(BS);
        let mut req = DleafWriteReq { segments: vec![seg(10, 1000, 5)] };
        assert_eq!(Dleaf::write(&mut bytes, BS, &mut req).unwrap(), WriteStatus::Done);

        let mut read = DleafReadReq { key: 8, count: 10, result: Vec::new() };
        Dleaf::read(&bytes, &mut read);
        assert_eq!(read.result.len(), 3);
        assert_eq!(read.result[0].state, SegState::Hole);
        assert_eq!(read.result[1], seg(10, 1000, 5));
        assert_eq!(read.result[2].state, SegState::Hole);
    }

    #[test]
    fn write_overwrites_overlapping_range() {
        let mut bytes = Dleaf::init(BS);
        let mut req = DleafWriteReq { segments: vec![seg(0, 100, 10)] };
        Dleaf::write(&mut bytes, BS, &mut req).unwrap();

        let mut req2 = DleafWriteReq { segments: vec![seg(4, 500, 2)] };
        Dleaf::write(&mut bytes, BS, &mut req2).unwrap();

        let mut read = DleafReadReq { key: 0, count: 10, result: Vec::new() };
        Dleaf::read(&bytes, &mut read);
        assert_eq!(read.result, vec![seg(0, 100, 4), seg(4, 500, 2), seg(6, 106, 4)]);
    }

    #[test]
    fn chop_punches_a_hole_and_reports_freed_blocks() {
        let mut bytes = Dleaf::init(BS);
        let mut req = DleafWriteReq { segments: vec![seg(0, 100, 10)] };
        Dleaf::write(&mut bytes, BS, &mut req).unwrap();

        let freed = Dleaf::chop(&mut bytes, 3, 6);
        assert_eq!(freed, vec![(103, 3)]);

        let mut read = DleafReadReq { key: 0, count: 10, result: Vec::new() };
        Dleaf::read(&bytes, &mut read);
        assert_eq!(read.result[0], seg(0, 100, 3));
        assert_eq!(read.result[1].state, SegState::Hole);
        assert_eq!(read.result[2], seg(6, 106, 4));
    }

    #[test]
    fn can_free_reports_true_only_when_empty() {
        let bytes = Dleaf::init(BS);
        assert!(Dleaf::can_free(&bytes));
        let mut bytes2 = bytes.clone();
        let mut req = DleafWriteReq { segments: vec![seg(0, 1, 1)] };
        Dleaf::write(&mut bytes2, BS, &mut req).unwrap();
        assert!(!Dleaf::can_free(&bytes2));
    }

    #[test]
    fn split_moves_upper_half_to_sibling() {
        let mut bytes = Dleaf::init(BS);
        let mut req = DleafWriteReq {
            segments: vec![seg(0, 10, 1), seg(2, 20, 1), seg(4, 30, 1), seg(6, 40, 1)],
        };
        Dleaf::write(&mut bytes, BS, &mut req).unwrap();

        let (right_bytes, sep) = Dleaf::split(&mut bytes, BS);
        let left = DleafRecord::decode(&bytes).unwrap();
        let right = DleafRecord::decode(&right_bytes).unwrap();
        assert_eq!(left.entries.len(), 2);
        assert_eq!(right.entries.len(), 2);
        assert_eq!(sep, right.entries[0].key);
    }

    #[test]
    fn merge_refuses_when_combination_overflows_capacity() {
        let cap = entries_per_leaf(BS);
        let mut left = DleafRecord { entries: (0..cap as u64).map(|k| DleafEntry {
            key: k * 2,
            extent: Extent::new(k + 1, 1, SegState::Mapped),
        }).collect() };
        let right = DleafRecord { entries: vec![DleafEntry { key: 999, extent: Extent::new(1, 1, SegState::Mapped) }] };
        let mut left_bytes = left.encode(BS);
        let right_bytes = right.encode(BS);
        assert!(!Dleaf::merge(&mut left_bytes, &right_bytes, BS));
        left.entries.truncate(cap - 1);
        let mut left_bytes = left.encode(BS);
        assert!(Dleaf::merge(&mut left_bytes, &right_bytes, BS));
    }
}
