//! Segment descriptors.
//!
//! Segments themselves are plain aligned memory blocks owned by the segment
//! store; all per-segment metadata lives here, in a table indexed by segment
//! number. A descriptor records the segment's free space, what kind of
//! objects it holds, which region owns it, and its position in the owning
//! region's free-space heap. `bufs` segments additionally carry the table of
//! back-references used to retarget buffer handles during compaction.

use logmem_common::constants::SEGMENT_SIZE;
use logmem_common::types::RegionId;

use crate::buffer::BufRecord;
use crate::occupancy::OccupancyStats;

/// Index of a segment in the pool's tables.
pub(crate) type SegmentIdx = u32;

/// Sentinel for "no segment" in intrusive links.
pub(crate) const NULL_SEGMENT: SegmentIdx = u32::MAX;

/// Sentinel for "not in any heap bucket".
pub(crate) const NO_BUCKET: u8 = u8::MAX;

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// What a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    /// Headered objects written by the small-allocation bump stream.
    Regular,
    /// Buffers written by the buffer bump stream.
    Bufs,
}

/// Per-segment metadata.
pub(crate) struct SegmentDescriptor {
    free_space: u32,
    kind: SegmentKind,
    /// Owning region; `None` iff the segment is not held by any region.
    pub(crate) region: Option<RegionId>,
    /// Back-references to live buffer handles; populated only for
    /// [`SegmentKind::Bufs`] segments. Every entry is engaged: frees pack
    /// the table so compaction only walks live buffers.
    pub(crate) buf_backrefs: Vec<*mut BufRecord>,
    /// Intrusive free-space heap links, maintained by the region's heap.
    pub(crate) heap_bucket: u8,
    pub(crate) heap_prev: SegmentIdx,
    pub(crate) heap_next: SegmentIdx,
}

impl Default for SegmentDescriptor {
    fn default() -> Self {
        Self {
            free_space: 0,
            kind: SegmentKind::Regular,
            region: None,
            buf_backrefs: Vec::new(),
            heap_bucket: NO_BUCKET,
            heap_prev: NULL_SEGMENT,
            heap_next: NULL_SEGMENT,
        }
    }
}

impl SegmentDescriptor {
    /// Resets the descriptor for a segment newly handed to a region.
    pub(crate) fn reset_for_region(&mut self, region: RegionId, kind: SegmentKind) {
        debug_assert_eq!(self.heap_bucket, NO_BUCKET);
        self.free_space = SEGMENT_SIZE as u32;
        self.kind = kind;
        self.region = Some(region);
    }

    pub(crate) fn free_space(&self) -> usize {
        self.free_space as usize
    }

    pub(crate) fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: SegmentKind) {
        self.kind = kind;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.free_space as usize == SEGMENT_SIZE
    }

    pub(crate) fn occupancy(&self) -> OccupancyStats {
        OccupancyStats::new(self.free_space as usize, SEGMENT_SIZE)
    }

    pub(crate) fn record_alloc(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.free_space as usize);
        self.free_space -= bytes as u32;
    }

    pub(crate) fn record_free(&mut self, bytes: usize) {
        self.free_space += bytes as u32;
        debug_assert!(self.free_space as usize <= SEGMENT_SIZE);
    }

    pub(crate) fn in_heap(&self) -> bool {
        self.heap_bucket != NO_BUCKET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 4096), 4096);
    }

    #[test]
    fn test_descriptor_accounting() {
        let mut desc = SegmentDescriptor::default();
        desc.reset_for_region(RegionId::new(1), SegmentKind::Regular);
        assert!(desc.is_empty());
        assert_eq!(desc.free_space(), SEGMENT_SIZE);

        desc.record_alloc(1000);
        assert!(!desc.is_empty());
        assert_eq!(desc.occupancy().used_space(), 1000);

        desc.record_free(1000);
        assert!(desc.is_empty());
    }
}
