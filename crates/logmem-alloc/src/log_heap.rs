//! Free-space bucketed heap over closed segments.
//!
//! Each region keeps its closed segments in a log-bucketed heap keyed by
//! free space. The bucket edges are chosen so that bucket 0 holds segments
//! below [`MIN_FREE_SPACE_FOR_COMPACTION`]; those are not worth compacting,
//! because moving their payload cannot free a whole segment. "Sparsest
//! first" then means popping from the highest non-empty bucket.
//!
//! The heap is intrusive: links live inside the segment descriptors and the
//! heap itself is a fixed array of bucket heads, so no operation ever
//! allocates. That matters because frees and compaction must not be able to
//! fail.

use logmem_common::constants::{MIN_FREE_SPACE_FOR_COMPACTION, SEGMENT_SIZE_SHIFT};
use logmem_common::types::RegionId;

use crate::segment::{SegmentDescriptor, SegmentIdx, NO_BUCKET, NULL_SEGMENT};

const MIN_FREE_LOG2: usize =
    usize::BITS as usize - 1 - MIN_FREE_SPACE_FOR_COMPACTION.leading_zeros() as usize;

/// Bucket 0 plus one bucket per free-space doubling up to a whole segment.
pub(crate) const NUM_BUCKETS: usize = SEGMENT_SIZE_SHIFT - MIN_FREE_LOG2 + 2;

fn bucket_for(free_space: usize) -> usize {
    if free_space < MIN_FREE_SPACE_FOR_COMPACTION {
        return 0;
    }
    let log2 = usize::BITS as usize - 1 - free_space.leading_zeros() as usize;
    (1 + log2 - MIN_FREE_LOG2).min(NUM_BUCKETS - 1)
}

/// Intrusive heap of segment descriptors bucketed by free space.
#[derive(Debug, Clone)]
pub(crate) struct SegmentHeap {
    heads: [SegmentIdx; NUM_BUCKETS],
    len: usize,
}

impl Default for SegmentHeap {
    fn default() -> Self {
        Self {
            heads: [NULL_SEGMENT; NUM_BUCKETS],
            len: 0,
        }
    }
}

impl SegmentHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if any segment is above the incompactible bucket.
    pub(crate) fn contains_above_min(&self) -> bool {
        self.heads[1..].iter().any(|&head| head != NULL_SEGMENT)
    }

    pub(crate) fn push(&mut self, descs: &mut [SegmentDescriptor], idx: SegmentIdx) {
        let i = idx as usize;
        debug_assert!(!descs[i].in_heap());
        let bucket = bucket_for(descs[i].free_space());
        let head = self.heads[bucket];
        descs[i].heap_bucket = bucket as u8;
        descs[i].heap_prev = NULL_SEGMENT;
        descs[i].heap_next = head;
        if head != NULL_SEGMENT {
            descs[head as usize].heap_prev = idx;
        }
        self.heads[bucket] = idx;
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, descs: &mut [SegmentDescriptor], idx: SegmentIdx) {
        let i = idx as usize;
        debug_assert!(descs[i].in_heap());
        let bucket = descs[i].heap_bucket as usize;
        let prev = descs[i].heap_prev;
        let next = descs[i].heap_next;
        if prev != NULL_SEGMENT {
            descs[prev as usize].heap_next = next;
        } else {
            self.heads[bucket] = next;
        }
        if next != NULL_SEGMENT {
            descs[next as usize].heap_prev = prev;
        }
        descs[i].heap_bucket = NO_BUCKET;
        descs[i].heap_prev = NULL_SEGMENT;
        descs[i].heap_next = NULL_SEGMENT;
        self.len -= 1;
    }

    /// Moves the descriptor to the bucket matching its current free space.
    pub(crate) fn adjust(&mut self, descs: &mut [SegmentDescriptor], idx: SegmentIdx) {
        let i = idx as usize;
        debug_assert!(descs[i].in_heap());
        let bucket = bucket_for(descs[i].free_space());
        if bucket != descs[i].heap_bucket as usize {
            self.remove(descs, idx);
            self.push(descs, idx);
        }
    }

    /// The segment with the most free space, if any.
    pub(crate) fn peek_sparsest(&self) -> Option<SegmentIdx> {
        self.heads
            .iter()
            .rev()
            .find(|&&head| head != NULL_SEGMENT)
            .copied()
    }

    pub(crate) fn pop_sparsest(&mut self, descs: &mut [SegmentDescriptor]) -> Option<SegmentIdx> {
        let idx = self.peek_sparsest()?;
        self.remove(descs, idx);
        Some(idx)
    }

    /// Reparents every segment to `new_region` and moves it into `dst`,
    /// leaving this heap empty. Allocation-free.
    pub(crate) fn drain_into(
        &mut self,
        descs: &mut [SegmentDescriptor],
        dst: &mut SegmentHeap,
        new_region: RegionId,
    ) {
        for bucket in 0..NUM_BUCKETS {
            let mut idx = self.heads[bucket];
            while idx != NULL_SEGMENT {
                let i = idx as usize;
                let next = descs[i].heap_next;
                descs[i].region = Some(new_region);
                descs[i].heap_bucket = NO_BUCKET;
                descs[i].heap_prev = NULL_SEGMENT;
                descs[i].heap_next = NULL_SEGMENT;
                self.len -= 1;
                dst.push(descs, idx);
                idx = next;
            }
            self.heads[bucket] = NULL_SEGMENT;
        }
    }
}
