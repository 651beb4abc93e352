//! Byte-range bookkeeping for one color of one session.
//!
//! Arriving data segments are stored keyed by start byte. Overlapping
//! arrivals are trimmed before insertion so stored ranges never
//! overlap, which keeps the received-byte counter equal to the number
//! of distinct bytes held.

use crate::wire::DataSegment;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// What became of an arriving segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored, possibly with its head or tail trimmed away.
    Inserted,
    /// Every byte was already held. Nothing stored.
    Duplicate,
}

/// What a report claim matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// At least one stored segment fell entirely inside the claim and
    /// was removed. `claimed_checkpoint` is set when one of them was
    /// a checkpoint.
    Removed { claimed_checkpoint: bool },
    /// Stored segments intersect the claim but none fits inside it.
    Mismatch,
    /// Nothing stored touches the claimed range.
    NotFound,
}

/// Result of one scan pass while trimming a candidate.
enum Scan {
    Clear,
    Duplicate,
    Supersede(u64),
    TrimHead(u64),
    TrimTail(u64),
}

/// Non-overlapping data segments ordered by start byte.
#[derive(Debug, Default)]
pub struct SegmentMap {
    segments: BTreeMap<u64, DataSegment>,
    bytes_received: u64,
    highest_seen: u64,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Distinct block bytes currently stored.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// One past the largest stop byte ever inserted.
    pub fn highest_seen(&self) -> u64 {
        self.highest_seen
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.bytes_received = 0;
    }

    pub fn segments(&self) -> impl Iterator<Item = &DataSegment> {
        self.segments.values()
    }

    /// Stored segments whose start byte is at or past `lower`.
    pub fn iter_from(&self, lower: u64) -> impl Iterator<Item = &DataSegment> {
        self.segments.range(lower..).map(|(_, seg)| seg)
    }

    pub fn get(&self, start: u64) -> Option<&DataSegment> {
        self.segments.get(&start)
    }

    pub fn get_mut(&mut self, start: u64) -> Option<&mut DataSegment> {
        self.segments.get_mut(&start)
    }

    /// Inserts without overlap checks. The caller guarantees the range
    /// is disjoint from everything stored.
    pub fn insert_unchecked(&mut self, seg: DataSegment) {
        self.bytes_received += seg.payload_len();
        self.highest_seen = self.highest_seen.max(seg.stop_byte() + 1);
        self.segments.insert(seg.offset, seg);
    }

    /// Inserts an arriving segment, trimming any overlap with stored
    /// data. Bytes already held win; only new bytes are kept.
    pub fn insert(&mut self, mut seg: DataSegment) -> InsertOutcome {
        // exact range match is the common retransmission case
        if let Some(existing) = self.segments.get(&seg.offset) {
            if existing.payload_len() == seg.payload_len() {
                return InsertOutcome::Duplicate;
            }
        }

        loop {
            let s_start = seg.start_byte();
            let s_stop = seg.stop_byte();
            let mut action = Scan::Clear;

            for existing in self.segments.values().rev() {
                let e_start = existing.start_byte();
                let e_stop = existing.stop_byte();

                if s_start > e_stop {
                    // everything further left stops before us too
                    break;
                }
                let left = s_start >= e_start && s_start <= e_stop;
                let right = s_stop >= e_start && s_stop <= e_stop;

                if left && right {
                    action = Scan::Duplicate;
                } else if s_start <= e_start && s_stop >= e_stop {
                    action = Scan::Supersede(e_start);
                } else if left {
                    action = Scan::TrimHead(e_stop + 1);
                } else if right {
                    action = Scan::TrimTail(e_start - 1);
                } else {
                    // disjoint, keep scanning left
                    continue;
                }
                break;
            }

            match action {
                Scan::Clear => break,
                Scan::Duplicate => return InsertOutcome::Duplicate,
                Scan::Supersede(key) => {
                    if let Some(old) = self.segments.remove(&key) {
                        self.bytes_received -= old.payload_len();
                    }
                }
                Scan::TrimHead(new_start) => {
                    let cut = (new_start - s_start) as usize;
                    seg.payload = seg.payload.slice(cut..);
                    seg.offset = new_start;
                }
                Scan::TrimTail(new_stop) => {
                    let keep = (new_stop - s_start + 1) as usize;
                    seg.payload = seg.payload.slice(..keep);
                }
            }
        }

        self.insert_unchecked(seg);
        InsertOutcome::Inserted
    }

    /// Removes every stored segment that fits entirely inside the
    /// claimed range. Partial overlaps are left alone.
    pub fn remove_claim(&mut self, claim_start: u64, claim_len: u64) -> ClaimOutcome {
        let claim_end = claim_start + claim_len;
        let mut to_remove = Vec::new();
        let mut intersected = false;

        for seg in self.segments.range(..claim_end).map(|(_, s)| s) {
            if seg.stop_byte() < claim_start {
                continue;
            }
            intersected = true;
            if seg.start_byte() >= claim_start && seg.stop_byte() < claim_end {
                to_remove.push(seg.offset);
            }
        }

        if to_remove.is_empty() {
            return if intersected { ClaimOutcome::Mismatch } else { ClaimOutcome::NotFound };
        }

        let mut claimed_checkpoint = false;
        for key in to_remove {
            if let Some(seg) = self.segments.remove(&key) {
                self.bytes_received -= seg.payload_len();
                claimed_checkpoint |= seg.checkpoint;
            }
        }
        ClaimOutcome::Removed { claimed_checkpoint }
    }

    /// Concatenates stored payloads in offset order. Only meaningful
    /// once the block is gap free.
    pub fn assemble(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.bytes_received as usize);
        for seg in self.segments.values() {
            out.put_slice(&seg.payload);
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Color, SessionId, SERVICE_ID_SINGLE};
    use proptest::prelude::*;

    fn pattern(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn seg(offset: u64, len: usize) -> DataSegment {
        let all = pattern(offset as usize + len);
        DataSegment::new(
            SessionId::new(1, 1),
            SERVICE_ID_SINGLE,
            Color::Red,
            offset,
            all.slice(offset as usize..),
        )
    }

    fn ranges(map: &SegmentMap) -> Vec<(u64, u64)> {
        map.segments().map(|s| (s.start_byte(), s.stop_byte())).collect()
    }

    #[test]
    fn overlap_trims_head_keeps_new_bytes() {
        let mut map = SegmentMap::new();
        assert_eq!(map.insert(seg(0, 10)), InsertOutcome::Inserted);
        assert_eq!(map.insert(seg(5, 10)), InsertOutcome::Inserted);

        assert_eq!(ranges(&map), vec![(0, 9), (10, 14)]);
        assert_eq!(map.bytes_received(), 15);
        assert_eq!(map.assemble(), pattern(15));
    }

    #[test]
    fn overlap_trims_tail() {
        let mut map = SegmentMap::new();
        assert_eq!(map.insert(seg(20, 10)), InsertOutcome::Inserted);
        assert_eq!(map.insert(seg(15, 10)), InsertOutcome::Inserted);

        assert_eq!(ranges(&map), vec![(15, 19), (20, 29)]);
        assert_eq!(map.bytes_received(), 15);
    }

    #[test]
    fn contained_arrival_is_duplicate() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 30));
        assert_eq!(map.insert(seg(5, 5)), InsertOutcome::Duplicate);
        assert_eq!(map.bytes_received(), 30);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn exact_duplicate_discarded() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        assert_eq!(map.insert(seg(0, 10)), InsertOutcome::Duplicate);
        assert_eq!(map.bytes_received(), 10);
    }

    #[test]
    fn larger_arrival_supersedes_stored() {
        let mut map = SegmentMap::new();
        map.insert(seg(5, 5));
        map.insert(seg(12, 3));
        assert_eq!(map.insert(seg(0, 20)), InsertOutcome::Inserted);

        assert_eq!(ranges(&map), vec![(0, 19)]);
        assert_eq!(map.bytes_received(), 20);
        assert_eq!(map.assemble(), pattern(20));
    }

    #[test]
    fn same_start_longer_supersedes() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 5));
        assert_eq!(map.insert(seg(0, 10)), InsertOutcome::Inserted);
        assert_eq!(ranges(&map), vec![(0, 9)]);
        assert_eq!(map.bytes_received(), 10);
    }

    #[test]
    fn bridging_arrival_trimmed_on_both_sides() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        map.insert(seg(20, 10));
        assert_eq!(map.insert(seg(5, 20)), InsertOutcome::Inserted);

        assert_eq!(ranges(&map), vec![(0, 9), (10, 19), (20, 29)]);
        assert_eq!(map.bytes_received(), 30);
        assert_eq!(map.assemble(), pattern(30));
    }

    #[test]
    fn highest_seen_tracks_inserts() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        assert_eq!(map.highest_seen(), 10);
        map.insert(seg(40, 10));
        assert_eq!(map.highest_seen(), 50);
        map.insert(seg(20, 5));
        assert_eq!(map.highest_seen(), 50);
    }

    #[test]
    fn claim_removes_exact_segment() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        let mut cp = seg(10, 10);
        cp.checkpoint = true;
        map.insert(cp);

        assert_eq!(map.remove_claim(10, 10), ClaimOutcome::Removed { claimed_checkpoint: true });
        assert_eq!(ranges(&map), vec![(0, 9)]);
        assert_eq!(map.bytes_received(), 10);
    }

    #[test]
    fn claim_removes_all_contained_segments() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        map.insert(seg(10, 10));
        map.insert(seg(20, 10));

        assert_eq!(
            map.remove_claim(0, 20),
            ClaimOutcome::Removed { claimed_checkpoint: false }
        );
        assert_eq!(ranges(&map), vec![(20, 29)]);
    }

    #[test]
    fn partial_claim_is_mismatch() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        assert_eq!(map.remove_claim(5, 10), ClaimOutcome::Mismatch);
        assert_eq!(map.bytes_received(), 10);
    }

    #[test]
    fn claim_outside_stored_ranges_not_found() {
        let mut map = SegmentMap::new();
        map.insert(seg(0, 10));
        assert_eq!(map.remove_claim(50, 10), ClaimOutcome::NotFound);
    }

    proptest! {
        #[test]
        fn counter_equals_distinct_bytes(
            arrivals in proptest::collection::vec((0u64..200, 1usize..40), 1..24)
        ) {
            let mut map = SegmentMap::new();
            for (offset, len) in arrivals {
                map.insert(seg(offset, len));
            }

            let total: u64 = map.segments().map(DataSegment::payload_len).sum();
            prop_assert_eq!(map.bytes_received(), total);

            // stored ranges never overlap and stay sorted
            let rs = ranges(&map);
            for pair in rs.windows(2) {
                prop_assert!(pair[0].1 < pair[1].0);
            }

            // stored content always matches the block pattern
            for s in map.segments() {
                let expect = pattern(s.stop_byte() as usize + 1);
                prop_assert_eq!(&s.payload[..], &expect[s.start_byte() as usize..]);
            }
        }
    }
}
