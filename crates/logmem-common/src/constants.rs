//! System-wide constants and policy thresholds.
//!
//! Segment geometry is fixed at compile time; the thresholds below drive the
//! compaction and eviction policy and are not meant to be tuned per
//! deployment.

/// log2 of the segment size.
pub const SEGMENT_SIZE_SHIFT: usize = 17;

/// Size of a segment in bytes (128 KiB). Segments are naturally aligned, so
/// the containing segment of any interior pointer is recovered by masking.
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SIZE_SHIFT;

/// Largest object served from segments. Bigger allocations are delegated to
/// the host allocator and accounted separately.
pub const MAX_MANAGED_OBJECT_SIZE: usize = SEGMENT_SIZE / 10;

/// When a region's average occupancy exceeds this ratio, eviction is
/// preferred over compaction.
pub const MAX_USED_SPACE_RATIO_FOR_COMPACTION: f64 = 0.85;

/// `SEGMENT_SIZE * MAX_USED_SPACE_RATIO_FOR_COMPACTION`, in bytes.
pub const MAX_USED_SPACE_FOR_COMPACTION: usize = SEGMENT_SIZE * 85 / 100;

/// Segments with less free space than this are not worth compacting: moving
/// their payload cannot free a full segment.
pub const MIN_FREE_SPACE_FOR_COMPACTION: usize = SEGMENT_SIZE - MAX_USED_SPACE_FOR_COMPACTION;

/// Alignment guaranteed for buffer allocations.
pub const BUF_ALIGN: usize = 4096;

/// Default cap on the pool's emergency segment reserve.
pub const DEFAULT_EMERGENCY_RESERVE_MAX: usize = 30;

/// Default minimum number of segments reclaimed per reclamation cycle.
pub const DEFAULT_RECLAMATION_STEP: usize = 1;

/// Successive refusals from reclaim-disabled regions tolerated by a single
/// segment-reclaim pass before it gives up.
pub const FAILED_RECLAIM_ALLOWANCE: usize = 10;

/// Background reclaim starts when free host memory drops below this.
pub const BACKGROUND_RECLAIM_THRESHOLD: usize = 60_000_000;

/// Default per-worker memory budget emulating the host allocator's capacity.
pub const DEFAULT_MEMORY_BUDGET: usize = 1 << 30;

// Segments which cannot fit MAX_MANAGED_OBJECT_SIZE must not be considered
// compactible, for the sake of forward progress of compaction.
const _: () = assert!(MIN_FREE_SPACE_FOR_COMPACTION >= MAX_MANAGED_OBJECT_SIZE);
const _: () = assert!(SEGMENT_SIZE % BUF_ALIGN == 0);
