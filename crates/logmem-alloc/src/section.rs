//! Allocating sections.
//!
//! Critical sections that must allocate with reclaim locked out need
//! headroom reserved up front, or the allocation fails with no way to make
//! progress. An [`AllocatingSection`] learns how much headroom a call site
//! needs: it reserves before entering, retries on allocation failure with
//! the failing reserve doubled, and periodically decays both reserves back
//! toward their minima so a transient spike doesn't pin memory forever.

use tracing::{debug, error};

use logmem_common::error::{MemError, MemResult};

use crate::region::{ReclaimLock, Region};
use crate::tracker::{worker_tracker, Tracker};

// Do not decay below these minimal values.
const MIN_LSA_RESERVE: usize = 1;
const MIN_STD_RESERVE: usize = 1024;
const BYTES_PER_DECAY: i64 = 10_000_000_000;
const SEGMENTS_PER_DECAY: i64 = 100_000;

/// Utility for running critical sections which lock a region and also
/// allocate memory. The object learns from failures how much it should
/// reserve up front in order to not cause allocation failures.
///
/// A retry invalidates references into the region (its reclaim counter is
/// bumped), so callers must treat pointers obtained before the failure as
/// stale.
pub struct AllocatingSection {
    /// Segment headroom refilled before each entry.
    lsa_reserve: usize,
    /// Host memory headroom in bytes.
    std_reserve: usize,
    minimum_lsa_reserve: usize,
    remaining_std_bytes_until_decay: i64,
    remaining_lsa_segments_until_decay: i64,
}

impl Default for AllocatingSection {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatingSection {
    /// Creates a section with minimal reserves.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lsa_reserve: MIN_LSA_RESERVE,
            std_reserve: MIN_STD_RESERVE,
            minimum_lsa_reserve: 0,
            remaining_std_bytes_until_decay: BYTES_PER_DECAY,
            remaining_lsa_segments_until_decay: SEGMENTS_PER_DECAY,
        }
    }

    /// Overrides the segment reserve.
    pub fn set_lsa_reserve(&mut self, segments: usize) {
        self.lsa_reserve = segments;
    }

    /// Overrides the host memory reserve.
    pub fn set_std_reserve(&mut self, bytes: usize) {
        self.std_reserve = bytes;
    }

    /// Current segment reserve.
    #[must_use]
    pub fn lsa_reserve(&self) -> usize {
        self.lsa_reserve
    }

    /// Current host memory reserve.
    #[must_use]
    pub fn std_reserve(&self) -> usize {
        self.std_reserve
    }

    /// Reserves memory, locks reclaim on `region`, and runs `f`, retrying
    /// with bigger reserves on allocation failure.
    ///
    /// Returns [`MemError::OutOfMemory`] when the reserves cannot be raised
    /// far enough; with `abort_on_lsa_bad_alloc` configured that aborts the
    /// process instead.
    pub fn run<T>(
        &mut self,
        region: &Region,
        mut f: impl FnMut() -> MemResult<T>,
    ) -> MemResult<T> {
        assert!(region.reclaiming_enabled());
        let tracker = worker_tracker();
        let prev_lsa_reserve = self.lsa_reserve;
        let prev_std_reserve = self.std_reserve;

        // The emergency reserve maximum is restored on the way out; nested
        // sections see and keep the outer section's floor.
        let saved_max = tracker.emergency_reserve_max();
        self.minimum_lsa_reserve = saved_max;
        let result = self.run_with_reserve(&tracker, region, &mut f);
        tracker.set_emergency_reserve_max(saved_max);

        if matches!(result, Err(MemError::OutOfMemory { .. })) {
            // Roll back the limits so one pathological request cannot
            // prevent future requests from succeeding.
            self.lsa_reserve = prev_lsa_reserve;
            self.std_reserve = prev_std_reserve;
        }
        result
    }

    fn run_with_reserve<T>(
        &mut self,
        tracker: &Tracker,
        region: &Region,
        f: &mut impl FnMut() -> MemResult<T>,
    ) -> MemResult<T> {
        self.reserve(tracker)?;
        self.maybe_decay_reserve();
        loop {
            let attempt = {
                let _lock = ReclaimLock::new(region);
                f()
            };
            match attempt {
                Err(MemError::OutOfMemory { .. }) => self.on_alloc_failure(tracker, region)?,
                other => return other,
            }
        }
    }

    /// Refills the segment reserve and drives host reclaim until the
    /// standard reserve is met.
    fn reserve(&mut self, tracker: &Tracker) -> MemResult<()> {
        let outcome = (|| {
            tracker.set_emergency_reserve_max(self.lsa_reserve.max(self.minimum_lsa_reserve));
            tracker.refill_emergency_reserve()?;

            loop {
                let free = tracker.free_host_memory();
                if free >= self.std_reserve {
                    break;
                }
                if tracker.reclaim(self.std_reserve - free) == 0 {
                    return Err(MemError::OutOfMemory {
                        bytes: self.std_reserve - free,
                    });
                }
            }

            tracker.clear_allocation_failure_flag();
            Ok(())
        })();
        if outcome.is_err() && tracker.should_abort_on_bad_alloc() {
            error!("aborting due to allocation failure");
            std::process::abort();
        }
        outcome
    }

    fn on_alloc_failure(&mut self, tracker: &Tracker, region: &Region) -> MemResult<()> {
        tracker.region_invalidate_references(region.id());
        if tracker.allocation_failure_flag() {
            self.lsa_reserve *= 2;
            debug!(
                "segment allocation failure, reserve raised to {} segments",
                self.lsa_reserve
            );
        } else {
            self.std_reserve *= 2;
            debug!(
                "host allocation failure, head-room raised to {} bytes",
                self.std_reserve
            );
        }
        self.reserve(tracker)
    }

    /// The decay rate is inversely proportional to the reserve: a large
    /// reserve is expensive to maintain, so it is retried against failure
    /// sooner; a small one can linger.
    fn maybe_decay_reserve(&mut self) {
        self.remaining_lsa_segments_until_decay -= self.lsa_reserve as i64;
        if self.remaining_lsa_segments_until_decay < 0 {
            self.remaining_lsa_segments_until_decay = SEGMENTS_PER_DECAY;
            self.lsa_reserve = MIN_LSA_RESERVE.max(self.lsa_reserve / 2);
            debug!("decaying segment reserve to {}", self.lsa_reserve);
        }

        self.remaining_std_bytes_until_decay -= self.std_reserve as i64;
        if self.remaining_std_bytes_until_decay < 0 {
            self.remaining_std_bytes_until_decay = BYTES_PER_DECAY;
            self.std_reserve = MIN_STD_RESERVE.max(self.std_reserve / 2);
            debug!("decaying host head-room to {} bytes", self.std_reserve);
        }
    }
}
