//! The worker-local tracker.
//!
//! One tracker exists per worker thread. It owns the segment pool and the
//! registry of regions, routes low-memory events into reclamation, and
//! orchestrates the compact-and-evict policy across regions. All mutable
//! allocator state sits behind a single `RefCell` with tightly scoped
//! borrows; user callbacks (eviction functions, blocked requests) always
//! run with the borrow released so they may allocate and free freely.
//!
//! Reclamation never runs reentrantly: every reclaim path takes the
//! reclaim guard, and a reclaim entered while the guard is held reports
//! zero progress instead of recursing.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use logmem_common::config::TrackerConfig;
use logmem_common::constants::{
    DEFAULT_RECLAMATION_STEP, FAILED_RECLAIM_ALLOWANCE, SEGMENT_SIZE, SEGMENT_SIZE_SHIFT,
};
use logmem_common::error::{MemError, MemResult};
use logmem_common::types::RegionId;

use crate::background::BackgroundReclaimer;
use crate::occupancy::OccupancyStats;
use crate::pool::{PoolStats, SegmentPool};
use crate::preempt::{need_preempt, IsPreemptible};
use crate::region::RegionInner;
use crate::segment::{align_up, SegmentIdx};

/// Result of a low-memory reclamation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimResult {
    /// Some memory was handed back to the host allocator.
    SomethingReclaimed,
    /// No progress was possible.
    NothingReclaimed,
}

/// Result of an idle compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCpuResult {
    /// No compactible region remains; stop calling until state changes.
    NoMoreWork,
    /// A higher-priority task became ready.
    InterruptedByHigherPriorityTask,
}

pub(crate) struct TrackerState {
    pub(crate) pool: SegmentPool,
    pub(crate) regions: HashMap<RegionId, RegionInner>,
    /// Registration order; drives the eviction fallback scan.
    pub(crate) region_order: Vec<RegionId>,
    pub(crate) reclamation_step: usize,
    pub(crate) abort_on_bad_alloc: bool,
    pub(crate) defragment_on_idle: bool,
    pub(crate) sanitizer_report_backtrace: bool,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            pool: SegmentPool::new(TrackerConfig::default().memory_budget),
            regions: HashMap::new(),
            region_order: Vec::new(),
            reclamation_step: DEFAULT_RECLAMATION_STEP,
            abort_on_bad_alloc: false,
            defragment_on_idle: false,
            sanitizer_report_backtrace: false,
        }
    }

    pub(crate) fn region_occupancy_of(&self, rid: RegionId) -> OccupancyStats {
        let r = &self.regions[&rid];
        let mut total = r.non_lsa_occupancy + r.closed_occupancy;
        if let Some(idx) = r.active {
            total += self.pool.desc(idx).occupancy();
        }
        if let Some(idx) = r.buf_active {
            total += self.pool.desc(idx).occupancy();
        }
        total
    }

    /// True if compaction of this region can make forward progress, so that
    /// `while is_compactible { compact_one }` terminates. Two segments of
    /// headroom per bump stream are required; there are two streams.
    pub(crate) fn is_compactible(&self, rid: RegionId) -> bool {
        let r = &self.regions[&rid];
        r.reclaiming_enabled
            && r.closed_occupancy.free_space() >= 4 * SEGMENT_SIZE
            && r.heap.contains_above_min()
    }

    pub(crate) fn is_evictable(&self, rid: RegionId) -> bool {
        let r = &self.regions[&rid];
        r.evictable && r.reclaiming_enabled
    }

    /// Occupancy of the region's sparsest closed segment.
    pub(crate) fn min_occupancy(&self, rid: RegionId) -> OccupancyStats {
        self.regions[&rid]
            .heap
            .peek_sparsest()
            .map(|idx| self.pool.desc(idx).occupancy())
            .unwrap_or_default()
    }

    /// The compactible region with the sparsest segment, if any.
    fn best_compactible_region(&self) -> Option<RegionId> {
        self.region_order
            .iter()
            .copied()
            .filter(|&rid| self.is_compactible(rid))
            .min_by(|&a, &b| {
                self.min_occupancy(a)
                    .used_fraction()
                    .partial_cmp(&self.min_occupancy(b).used_fraction())
                    .unwrap_or(Ordering::Equal)
            })
    }
}

impl Drop for TrackerState {
    fn drop(&mut self) {
        for rid in &self.region_order {
            error!("region id={} not unregistered at tracker shutdown", rid);
        }
    }
}

/// Controller for all regions on this worker.
///
/// Obtained via [`worker_tracker`]; regions register themselves with their
/// worker's tracker on construction. The tracker is `!Send`, which is what
/// pins every region to the worker that created it.
pub struct Tracker {
    pub(crate) state: RefCell<TrackerState>,
    pub(crate) reclaim_enabled: Cell<bool>,
    background: RefCell<Option<BackgroundReclaimer>>,
}

thread_local! {
    pub(crate) static TRACKER: Rc<Tracker> = Rc::new(Tracker::new());
}

/// Returns this worker's tracker, creating it on first use.
pub fn worker_tracker() -> Rc<Tracker> {
    TRACKER.with(Rc::clone)
}

/// Restores the tracker reclaim guard on drop.
///
/// Prevents the tracker's reclaimer from running while live. Reclaim may be
/// invoked synchronously with allocation; this guard ensures the tracker is
/// not re-entered while inside one of its own reclamation paths.
pub(crate) struct TrackerReclaimLock<'a> {
    tracker: &'a Tracker,
    prev: bool,
}

impl<'a> TrackerReclaimLock<'a> {
    pub(crate) fn new(tracker: &'a Tracker) -> Self {
        let prev = tracker.reclaim_enabled.replace(false);
        Self { tracker, prev }
    }
}

impl Drop for TrackerReclaimLock<'_> {
    fn drop(&mut self) {
        self.tracker.reclaim_enabled.set(self.prev);
    }
}

/// Scoped override of the pool's emergency reserve goal.
pub(crate) struct EmergencyGoalGuard<'a> {
    tracker: &'a Tracker,
    prev: usize,
}

impl<'a> EmergencyGoalGuard<'a> {
    pub(crate) fn new(tracker: &'a Tracker, goal: usize) -> Self {
        let mut st = tracker.state.borrow_mut();
        let prev = st.pool.current_emergency_reserve_goal();
        st.pool.set_current_emergency_reserve_goal(goal);
        Self { tracker, prev }
    }
}

impl Drop for EmergencyGoalGuard<'_> {
    fn drop(&mut self) {
        self.tracker
            .state
            .borrow_mut()
            .pool
            .set_current_emergency_reserve_goal(self.prev);
    }
}

/// Scoped hold on host segment allocation.
pub(crate) struct AllocationLockGuard<'a> {
    tracker: &'a Tracker,
    prev: bool,
}

impl<'a> AllocationLockGuard<'a> {
    pub(crate) fn new(tracker: &'a Tracker) -> Self {
        let prev = tracker.state.borrow_mut().pool.set_allocation_enabled(false);
        Self { tracker, prev }
    }
}

impl Drop for AllocationLockGuard<'_> {
    fn drop(&mut self) {
        self.tracker
            .state
            .borrow_mut()
            .pool
            .set_allocation_enabled(self.prev);
    }
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: RefCell::new(TrackerState::new()),
            reclaim_enabled: Cell::new(true),
            background: RefCell::new(None),
        }
    }

    /// Applies configuration. The memory budget can only change while the
    /// pool holds no segments; later changes are ignored with a warning.
    pub fn configure(&self, config: &TrackerConfig) -> MemResult<()> {
        config.validate().map_err(MemError::invalid_config)?;
        {
            let mut st = self.state.borrow_mut();
            st.reclamation_step = config.lsa_reclamation_step;
            st.abort_on_bad_alloc = config.abort_on_lsa_bad_alloc;
            st.defragment_on_idle = config.defragment_on_idle;
            st.sanitizer_report_backtrace = config.sanitizer_report_backtrace;
            if config.memory_budget != st.pool.memory_budget() {
                if st.pool.segments_allocated() == 0 {
                    st.pool.set_budget(config.memory_budget);
                } else {
                    warn!("memory budget change ignored; the pool is already active");
                }
            }
        }
        if let Some(bg) = &config.background_reclaim {
            let mut slot = self.background.borrow_mut();
            if slot.is_none() {
                *slot = Some(BackgroundReclaimer::spawn(worker_tracker(), bg.clone()));
                info!("background reclaim enabled");
            }
        }
        Ok(())
    }

    /// Stops the background reclaim task, if one is running.
    pub async fn stop(&self) {
        let background = self.background.borrow_mut().take();
        if let Some(background) = background {
            background.stop().await;
        }
    }

    // --- public reclamation surface ---

    /// Tries to reclaim the given number of bytes from all compactible and
    /// evictable regions. Returns the number of bytes actually reclaimed,
    /// which may be smaller when evictable pools are empty and compactible
    /// pools cannot compact any more.
    ///
    /// Invalidates references to objects in all compactible and evictable
    /// regions.
    pub fn reclaim(&self, bytes: usize) -> usize {
        self.reclaim_inner(bytes, IsPreemptible::No)
    }

    /// Like [`reclaim`](Self::reclaim), but polls the preemption predicate
    /// between segments and regions and may return early with partial
    /// progress.
    pub fn reclaim_preemptibly(&self, bytes: usize) -> usize {
        self.reclaim_inner(bytes, IsPreemptible::Yes)
    }

    /// The host allocator's low-memory entry point. The request is rounded
    /// up to the reclamation step.
    pub fn on_low_memory(&self, request: usize) -> ReclaimResult {
        let step = self.reclamation_step();
        if self.reclaim_inner(request.max(step * SEGMENT_SIZE), IsPreemptible::No) > 0 {
            ReclaimResult::SomethingReclaimed
        } else {
            ReclaimResult::NothingReclaimed
        }
    }

    pub(crate) fn reclaim_inner(&self, bytes: usize, preempt: IsPreemptible) -> usize {
        if !self.reclaim_enabled.get() {
            return 0;
        }
        let _lock = TrackerReclaimLock::new(self);
        let mut timer = ReclaimTimer::new(self, "reclaim", preempt, bytes, 0);
        let released = self.reclaim_locked(bytes, preempt);
        timer.set_memory_released(released);
        released
    }

    fn reclaim_locked(&self, memory_to_release: usize, preempt: IsPreemptible) -> usize {
        debug!("reclaim_locked({}, preempt={:?})", memory_to_release, preempt);
        // Reclamation steps:
        // 1. Try to release free segments from the pool and the reserve.
        // 2. Compact used segments and/or evict data.
        const MAX_BYTES: usize = usize::MAX - SEGMENT_SIZE;
        let segments_to_release =
            align_up(memory_to_release.min(MAX_BYTES), SEGMENT_SIZE) >> SEGMENT_SIZE_SHIFT;
        let released_segments = self.reclaim_segments(segments_to_release, preempt);
        let mut mem_released = released_segments * SEGMENT_SIZE;
        if mem_released >= memory_to_release {
            return memory_to_release;
        }
        if preempt.is_yes() && need_preempt() {
            return mem_released;
        }

        let goal = self.state.borrow().pool.current_emergency_reserve_goal();
        let compacted =
            self.compact_and_evict_locked(goal, memory_to_release - mem_released, preempt);
        if compacted == 0 {
            return mem_released;
        }

        // Compaction does not return segments to the host, so do it here.
        let released_segments = self.reclaim_segments(compacted / SEGMENT_SIZE, preempt);
        mem_released += released_segments * SEGMENT_SIZE;
        debug!("reclaim_locked() = {}", mem_released);
        mem_released
    }

    /// Releases whole segments back to the host allocator, walking owned
    /// segments from the lowest address up and compacting in-use candidates
    /// on the way. Returns the number of segments released.
    pub(crate) fn reclaim_segments(&self, target: usize, preempt: IsPreemptible) -> usize {
        debug!("trying to reclaim {} segments", target);
        let mut reclaimed = 0;
        let mut timer = ReclaimTimer::new(
            self,
            "reclaim_segments",
            preempt,
            target.saturating_mul(SEGMENT_SIZE),
            target,
        );

        // A region with reclaim disabled refuses compaction. Refusals are
        // cheap to detect but a run of them can pin the low addresses and
        // leave reclaimed memory fragmented, so the pass gives up after a
        // bounded number and lets the caller raise reserves and retry.
        let mut failed_allowance = FAILED_RECLAIM_ALLOWANCE;

        let mut cursor = self.state.borrow().pool.first_owned();
        while let Some(idx) = cursor {
            let proceed = {
                let st = self.state.borrow();
                reclaimed != target
                    && st.pool.free_segments() > st.pool.current_emergency_reserve_goal()
            };
            if !proceed {
                break;
            }
            let is_free = self.state.borrow().pool.is_free(idx);
            if !is_free {
                if !self.compact_segment_from_pool(idx) {
                    failed_allowance -= 1;
                    if failed_allowance == 0 {
                        break;
                    }
                    cursor = self.state.borrow().pool.next_owned(idx);
                    continue;
                }
            }
            self.state.borrow_mut().pool.release_to_host(idx);
            reclaimed += 1;
            if preempt.is_yes() && need_preempt() {
                break;
            }
            cursor = self.state.borrow().pool.next_owned(idx);
        }

        debug!("reclaimed {} segments (requested {})", reclaimed, target);
        timer.set_memory_released(reclaimed * SEGMENT_SIZE);
        reclaimed
    }

    /// Relocates one in-use segment's live objects so the segment can be
    /// released. Fails when the owning region has reclaim disabled.
    fn compact_segment_from_pool(&self, idx: SegmentIdx) -> bool {
        let rid = {
            let st = self.state.borrow();
            let desc = st.pool.desc(idx);
            let rid = desc.region.expect("compacting a segment no region owns");
            if !st.regions[&rid].reclaiming_enabled {
                return false;
            }
            rid
        };
        // Dip into the emergency reserve for the destination, and keep both
        // host allocation and reclaim out of the way while objects move.
        let _goal = EmergencyGoalGuard::new(self, 0);
        let _no_alloc = AllocationLockGuard::new(self);
        let _no_reclaim = TrackerReclaimLock::new(self);
        self.region_compact_segment(rid, idx);
        true
    }

    /// Allocates one segment for a region or the reserve.
    ///
    /// 1. Take an owned free segment if more than `reserve` remain.
    /// 2. Claim a fresh segment from the host if the budget allows.
    /// 3. Compact and evict, then retry.
    ///
    /// Returns `None` when all three steps are exhausted.
    pub(crate) fn allocate_segment(&self, reserve: usize) -> Option<SegmentIdx> {
        loop {
            {
                let _no_reclaim = TrackerReclaimLock::new(self);
                let mut st = self.state.borrow_mut();
                if let Some(idx) = st.pool.try_take_free(reserve) {
                    return Some(idx);
                }
                if let Some(idx) = st.pool.try_allocate_from_host() {
                    return Some(idx);
                }
            }
            let step = self.reclamation_step();
            if self.compact_and_evict(reserve, step * SEGMENT_SIZE, IsPreemptible::No) == 0 {
                return None;
            }
        }
    }

    /// Refills the free set up to the emergency reserve maximum.
    pub(crate) fn refill_emergency_reserve(&self) -> MemResult<()> {
        loop {
            let (free, max) = {
                let st = self.state.borrow();
                (st.pool.free_segments(), st.pool.emergency_reserve_max())
            };
            if free >= max {
                return Ok(());
            }
            match self.allocate_segment(max) {
                Some(idx) => self.state.borrow_mut().pool.mark_free(idx),
                None => return Err(MemError::OutOfMemory {
                    bytes: SEGMENT_SIZE,
                }),
            }
        }
    }

    /// Best-effort top-up of the free set to `count` segments.
    pub(crate) fn reserve_free_segments(&self, count: usize) {
        loop {
            if self.state.borrow().pool.free_segments() >= count {
                return;
            }
            match self.allocate_segment(count) {
                Some(idx) => self.state.borrow_mut().pool.mark_free(idx),
                None => return,
            }
        }
    }

    /// Like [`compact_and_evict_locked`](Self::compact_and_evict_locked)
    /// but takes the reclaim guard; reports zero when reclaim is already in
    /// progress.
    pub(crate) fn compact_and_evict(
        &self,
        reserve_segments: usize,
        bytes: usize,
        preempt: IsPreemptible,
    ) -> usize {
        if !self.reclaim_enabled.get() {
            return 0;
        }
        let _lock = TrackerReclaimLock::new(self);
        self.compact_and_evict_locked(reserve_segments, bytes, preempt)
    }

    /// Frees memory by compacting the sparsest regions and evicting from
    /// evictable ones, until the target is met, no compactible region
    /// remains, or the pass is preempted. Returns the drop in pool memory
    /// in use.
    fn compact_and_evict_locked(
        &self,
        reserve_segments: usize,
        mut memory_to_release: usize,
        preempt: IsPreemptible,
    ) -> usize {
        debug!(
            "compact_and_evict_locked({}, {}, {:?})",
            reserve_segments, memory_to_release, preempt
        );

        let (mem_in_use, free_segments) = {
            let st = self.state.borrow();
            (st.pool.total_memory_in_use(), st.pool.free_segments())
        };
        memory_to_release = memory_to_release.saturating_add(
            (reserve_segments - reserve_segments.min(free_segments)).saturating_mul(SEGMENT_SIZE),
        );
        let target_mem = mem_in_use - mem_in_use.min(memory_to_release);
        debug!(
            "compacting, requested {} bytes, {} bytes in use, target is {}",
            memory_to_release, mem_in_use, target_mem
        );

        // Allow dipping into reserves while compacting.
        let _goal = EmergencyGoalGuard::new(self, 0);

        enum Work {
            Compact(RegionId),
            Evict(RegionId),
        }

        {
            let mut timer = ReclaimTimer::new(
                self,
                "compact",
                preempt,
                memory_to_release,
                reserve_segments,
            );
            loop {
                let work = {
                    let st = self.state.borrow();
                    if st.pool.total_memory_in_use() <= target_mem {
                        None
                    } else {
                        match st.best_compactible_region() {
                            None => {
                                trace!("unable to release segments, no compactible pools");
                                None
                            }
                            Some(rid) => {
                                // Prefer eviction for hot dense regions: when
                                // allocation order matches eviction order the
                                // memory comes back without copying anything.
                                let occ = st.region_occupancy_of(rid);
                                let dense = occ.used_space() as f64
                                    >= logmem_common::constants::MAX_USED_SPACE_RATIO_FOR_COMPACTION
                                        * occ.total_space() as f64;
                                if st.is_evictable(rid) && dense {
                                    Some(Work::Evict(rid))
                                } else {
                                    Some(Work::Compact(rid))
                                }
                            }
                        }
                    }
                };
                match work {
                    None => break,
                    Some(Work::Compact(rid)) => self.region_compact_one(rid),
                    Some(Work::Evict(rid)) => {
                        self.reclaim_from_evictable(rid, target_mem, preempt)
                    }
                }
                if preempt.is_yes() && need_preempt() {
                    break;
                }
            }
            timer.set_memory_released(
                mem_in_use.saturating_sub(self.state.borrow().pool.total_memory_in_use()),
            );
        }

        // Compaction alone was not enough; fall back to draining evictable
        // regions in registration order.
        // TODO: fair eviction - rotate the starting region between passes.
        if self.state.borrow().pool.total_memory_in_use() > target_mem {
            debug!("considering evictable regions");
            let order = self.state.borrow().region_order.clone();
            for rid in order {
                if preempt.is_yes() && need_preempt() {
                    break;
                }
                let evictable = {
                    let st = self.state.borrow();
                    st.regions.contains_key(&rid) && st.is_evictable(rid)
                };
                if evictable {
                    self.reclaim_from_evictable(rid, target_mem, preempt);
                    if self.state.borrow().pool.total_memory_in_use() <= target_mem {
                        break;
                    }
                }
            }
        }

        let released =
            mem_in_use.saturating_sub(self.state.borrow().pool.total_memory_in_use());
        debug!(
            "released {} bytes (wanted {})",
            released, memory_to_release
        );
        released
    }

    /// Evicts from one region until pool memory in use drops to the target,
    /// the evictor runs dry, or the pass is preempted. Eviction runs at
    /// least one segment ahead of the deficit so that workloads whose
    /// eviction order matches allocation order free whole segments without
    /// compaction.
    fn reclaim_from_evictable(
        &self,
        rid: RegionId,
        target_mem_in_use: usize,
        preempt: IsPreemptible,
    ) {
        let used_target = {
            let st = self.state.borrow();
            let total = st.pool.total_memory_in_use();
            debug!(
                "reclaim_from_evictable: total_memory_in_use={} target={}",
                total, target_mem_in_use
            );
            let deficit = total.saturating_sub(target_mem_in_use);
            let used = st.region_occupancy_of(rid).used_space();
            used - used.min(deficit + SEGMENT_SIZE)
        };

        loop {
            {
                let st = self.state.borrow();
                if st.pool.total_memory_in_use() <= target_mem_in_use {
                    return;
                }
            }
            loop {
                let (used, compactible) = {
                    let st = self.state.borrow();
                    (st.region_occupancy_of(rid).used_space(), st.is_compactible(rid))
                };
                if used <= used_target && compactible {
                    break;
                }
                if self.evict_some_internal(rid) == crate::region::EvictionResult::Nothing {
                    let compactible = self.state.borrow().is_compactible(rid);
                    if compactible {
                        // Forward progress is possible without eviction.
                        break;
                    }
                    debug!("unable to evict more from region {}", rid);
                    return;
                }
                let met = {
                    let st = self.state.borrow();
                    st.pool.total_memory_in_use() <= target_mem_in_use
                };
                if met {
                    return;
                }
                if preempt.is_yes() && need_preempt() {
                    debug!("reclaim_from_evictable preempted");
                    return;
                }
            }
            // The eviction loop can exit straight into compaction many
            // times in a row, so the preemption check is repeated here.
            if preempt.is_yes() && need_preempt() {
                debug!("reclaim_from_evictable preempted");
                return;
            }
            debug!("compacting region {} after eviction", rid);
            self.region_compact_one(rid);
        }
    }

    /// Compacts one segment at a time, sparsest region first, until the
    /// check reports pending work or no compactible region remains.
    pub fn compact_on_idle(&self, mut check_for_work: impl FnMut() -> bool) -> IdleCpuResult {
        if !self.state.borrow().defragment_on_idle || !self.reclaim_enabled.get() {
            return IdleCpuResult::NoMoreWork;
        }
        let _lock = TrackerReclaimLock::new(self);
        if self.state.borrow().region_order.is_empty() {
            return IdleCpuResult::NoMoreWork;
        }
        let _goal = EmergencyGoalGuard::new(self, 0);
        while !check_for_work() {
            let Some(rid) = self.state.borrow().best_compactible_region() else {
                return IdleCpuResult::NoMoreWork;
            };
            self.region_compact_one(rid);
        }
        IdleCpuResult::InterruptedByHigherPriorityTask
    }

    /// Compacts as much as possible. Very expensive, mainly for testing.
    /// Guarantees that every live object from reclaimable regions will be
    /// moved. Invalidates references into all such regions.
    pub fn full_compaction(&self) {
        let _lock = TrackerReclaimLock::new(self);
        debug!("full compaction on all regions, {}", self.region_occupancy_unlocked());
        let order = self.state.borrow().region_order.clone();
        for rid in order {
            let enabled = {
                let st = self.state.borrow();
                st.regions.get(&rid).map(|r| r.reclaiming_enabled).unwrap_or(false)
            };
            if enabled {
                self.region_full_compaction(rid);
            }
        }
        debug!("compaction done, {}", self.region_occupancy_unlocked());
    }

    /// Returns every free segment's memory to the host allocator.
    pub fn reclaim_all_free_segments(&self) {
        debug!("reclaiming all free segments");
        self.reclaim_segments(usize::MAX, IsPreemptible::No);
        debug!("reclamation done");
    }

    /// Primes the pool: claims the worker's memory so segments occupy the
    /// high addresses, then returns a low gap to the host for non-LSA use.
    pub fn prime(&self, available_memory: usize, min_free_memory: usize) {
        let old_max = {
            let mut st = self.state.borrow_mut();
            let old = st.pool.emergency_reserve_max();
            st.pool.set_emergency_reserve_max(usize::MAX);
            st.pool.set_non_lsa_reserve(0);
            old
        };
        let _ = self.refill_emergency_reserve();
        {
            let mut st = self.state.borrow_mut();
            st.pool.set_emergency_reserve_max(old_max);
            // Leave more than the bare minimum free so that segment-moving
            // reclaim is not triggered on every small host allocation.
            let gap = (available_memory / 16).clamp(1 << 20, 32 << 20);
            st.pool.set_non_lsa_reserve(min_free_memory + gap);
        }
        let reserve_segments = self.state.borrow().pool.non_lsa_reserve() / SEGMENT_SIZE;
        self.reclaim_segments(reserve_segments, IsPreemptible::No);
    }

    // --- observability ---

    /// Aggregate occupancy of all regions.
    pub fn region_occupancy(&self) -> OccupancyStats {
        self.region_occupancy_unlocked()
    }

    fn region_occupancy_unlocked(&self) -> OccupancyStats {
        let st = self.state.borrow();
        st.region_order
            .iter()
            .fold(OccupancyStats::default(), |acc, &rid| {
                acc + st.region_occupancy_of(rid)
            })
    }

    /// Occupancy of all segments held by the pool, free ones included.
    pub fn occupancy(&self) -> OccupancyStats {
        let mut occ = self.region_occupancy_unlocked();
        let free = self.state.borrow().pool.total_free_memory();
        occ += OccupancyStats::new(free, free);
        occ
    }

    /// Memory allocated through regions but not held in segments.
    pub fn non_lsa_used_space(&self) -> usize {
        self.state.borrow().pool.non_lsa_memory_in_use()
    }

    /// Free host memory under the worker's budget.
    pub fn free_host_memory(&self) -> usize {
        self.state.borrow().pool.free_memory()
    }

    /// Memory held in free segments beyond the emergency reserve.
    pub fn unreserved_free_segment_memory(&self) -> usize {
        self.state.borrow().pool.unreserved_free_segments() * SEGMENT_SIZE
    }

    /// Pool counters.
    pub fn statistics(&self) -> PoolStats {
        self.state.borrow().pool.statistics()
    }

    /// The minimum number of segments reclaimed per reclamation cycle.
    pub fn reclamation_step(&self) -> usize {
        self.state.borrow().reclamation_step
    }

    /// Whether allocation failure escalates to abort after retries.
    pub fn should_abort_on_bad_alloc(&self) -> bool {
        self.state.borrow().abort_on_bad_alloc
    }

    // --- reserve plumbing for allocating sections ---

    pub(crate) fn emergency_reserve_max(&self) -> usize {
        self.state.borrow().pool.emergency_reserve_max()
    }

    pub(crate) fn set_emergency_reserve_max(&self, max: usize) {
        self.state.borrow_mut().pool.set_emergency_reserve_max(max);
    }

    pub(crate) fn allocation_failure_flag(&self) -> bool {
        self.state.borrow().pool.allocation_failure_flag()
    }

    pub(crate) fn clear_allocation_failure_flag(&self) {
        self.state.borrow_mut().pool.clear_allocation_failure_flag();
    }
}

const STALL_THRESHOLD: Duration = Duration::from_millis(100);

thread_local! {
    static TIMER_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Measures one reclaim pass and reports it on drop; warns when the pass
/// stalls the worker. Only the outermost timer on a worker is live.
pub(crate) struct ReclaimTimer<'a> {
    tracker: &'a Tracker,
    name: &'static str,
    preempt: IsPreemptible,
    memory_to_release: usize,
    segments_to_release: usize,
    memory_released: usize,
    start: Instant,
    start_stats: PoolStats,
    live: bool,
}

impl<'a> ReclaimTimer<'a> {
    fn new(
        tracker: &'a Tracker,
        name: &'static str,
        preempt: IsPreemptible,
        memory_to_release: usize,
        segments_to_release: usize,
    ) -> Self {
        let live = TIMER_ACTIVE.with(|active| !active.replace(true));
        let start_stats = if live {
            tracker.state.borrow().pool.statistics()
        } else {
            PoolStats::default()
        };
        Self {
            tracker,
            name,
            preempt,
            memory_to_release,
            segments_to_release,
            memory_released: 0,
            start: Instant::now(),
            start_stats,
            live,
        }
    }

    fn set_memory_released(&mut self, released: usize) {
        self.memory_released = released;
    }
}

impl Drop for ReclaimTimer<'_> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        TIMER_ACTIVE.with(|active| active.set(false));
        let duration = self.start.elapsed();
        let stalled = duration >= STALL_THRESHOLD;
        if !stalled && !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let diff = self.tracker.state.borrow().pool.statistics() - self.start_stats;
        if stalled {
            warn!(
                "{} took {:?}, trying to release {} bytes ({} segments) {}preemptibly; \
                 compacted {} segments / {} bytes, evicted {} bytes, released {} bytes",
                self.name,
                duration,
                self.memory_to_release,
                self.segments_to_release,
                if self.preempt.is_yes() { "" } else { "non-" },
                diff.segments_compacted,
                diff.memory_compacted,
                diff.memory_evicted,
                self.memory_released,
            );
        } else {
            debug!(
                "{} took {:?}, released {} of {} bytes (compacted {} segments)",
                self.name,
                duration,
                self.memory_released,
                self.memory_to_release,
                diff.segments_compacted,
            );
        }
    }
}

// --- global statistics accessors ---

/// Total bytes requested from region allocators on this worker.
pub fn memory_allocated() -> u64 {
    worker_tracker().statistics().memory_allocated
}

/// Total bytes requested to be freed on this worker.
pub fn memory_freed() -> u64 {
    worker_tracker().statistics().memory_freed
}

/// Total bytes copied by segment compaction on this worker.
pub fn memory_compacted() -> u64 {
    worker_tracker().statistics().memory_compacted
}

/// Total bytes freed by eviction callbacks on this worker.
pub fn memory_evicted() -> u64 {
    worker_tracker().statistics().memory_evicted
}

/// Free versus in-use memory across the worker's pool.
pub fn global_occupancy() -> OccupancyStats {
    let tracker = worker_tracker();
    let st = tracker.state.borrow();
    let free = st.pool.total_free_memory();
    OccupancyStats::new(free, st.pool.total_memory_in_use() + free)
}
