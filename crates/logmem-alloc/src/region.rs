//! Log-structured allocator regions.
//!
//! Objects are allocated inside fixed-size segments and never cross a
//! segment boundary. Active allocations are served from a single segment
//! using the bump-the-pointer method; that segment is the active segment.
//! When it fills up it is closed, and closed segments are kept in a
//! free-space heap. As objects are freed the closed segments become sparser
//! and are eventually released or compacted. Objects too large for a
//! segment are delegated to the host allocator.
//!
//! Segment layout: objects are laid out sequentially, each preceded by a
//! variable-length header (the codec lives in `vle`). Object alignment is
//! respected by widening the header to absorb the gap, so walking headers
//! forward visits every object and decoding backwards from a payload
//! recovers its header. Buffers use a second bump stream over dedicated
//! segments with no headers; their bookkeeping lives in the segment
//! descriptor.

use std::alloc::{alloc as host_alloc, dealloc as host_dealloc, Layout};
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use logmem_common::constants::{BUF_ALIGN, MAX_MANAGED_OBJECT_SIZE, SEGMENT_SIZE};
use logmem_common::error::{MemError, MemResult};
use logmem_common::types::{MigratorId, RegionId};

use crate::buffer::{BufRecord, LsaBuffer};
use crate::log_heap::SegmentHeap;
use crate::migrator::migrator;
use crate::occupancy::OccupancyStats;
use crate::pool::SegmentPool;
use crate::preempt::IsPreemptible;
use crate::sanitizer::RegionSanitizer;
use crate::segment::{align_up, SegmentIdx, SegmentKind};
use crate::tracker::{worker_tracker, Tracker, TrackerState};
use crate::vle;

/// Marker trailing every delegated large allocation, checked at free.
const NON_LSA_COOKIE: u64 = 0xbadc_affe;

/// Bytes reserved in front of a large allocation for its size and layout
/// records.
const NON_LSA_MIN_PREFIX: usize = 16;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(0);

/// Outcome of one eviction callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionResult {
    /// Some objects were freed.
    Evicted,
    /// Nothing left to evict.
    Nothing,
}

/// Observer of one region's memory footprint.
///
/// Region groups implement this to aggregate usage across regions. All
/// methods are called from inside the allocator: implementations must not
/// call back into regions, the tracker, or any other allocator operation.
pub trait RegionListener {
    /// The region joined the listener with the given total space.
    fn on_add(&self, region: RegionId, total_space: usize);
    /// The region left the listener; `total_space` is its current total.
    fn on_del(&self, region: RegionId, total_space: usize);
    /// The region's total space changed by `delta` bytes.
    fn on_usage_change(&self, region: RegionId, delta: isize);
    /// The region's evictable occupancy was grounded to zero.
    fn on_evictable_grounded(&self, region: RegionId);
}

/// Per-region allocator state. Lives inside the tracker.
pub(crate) struct RegionInner {
    pub(crate) id: RegionId,
    pub(crate) reclaiming_enabled: bool,
    pub(crate) active: Option<SegmentIdx>,
    pub(crate) active_offset: usize,
    pub(crate) buf_active: Option<SegmentIdx>,
    pub(crate) buf_active_offset: usize,
    /// Closed segments, bucketed by free space.
    pub(crate) heap: SegmentHeap,
    pub(crate) closed_occupancy: OccupancyStats,
    pub(crate) non_lsa_occupancy: OccupancyStats,
    /// Coarse usage reported to the listener; only maintained while a
    /// listener is attached.
    pub(crate) evictable_space: usize,
    pub(crate) evictable_grounded: bool,
    pub(crate) evictable: bool,
    pub(crate) eviction_fn: Option<Rc<dyn Fn() -> EvictionResult>>,
    pub(crate) invalidate_counter: u64,
    pub(crate) sanitizer: RegionSanitizer,
    pub(crate) listener: Option<Rc<dyn RegionListener>>,
    /// Scratch holding the source back-reference table during buffer
    /// segment compaction, so moving it cannot fail mid-compaction.
    pub(crate) buf_scratch: Vec<*mut BufRecord>,
}

impl RegionInner {
    fn new(
        id: RegionId,
        listener: Option<Rc<dyn RegionListener>>,
        report_backtrace: bool,
    ) -> Self {
        Self {
            id,
            reclaiming_enabled: true,
            active: None,
            active_offset: 0,
            buf_active: None,
            buf_active_offset: 0,
            heap: SegmentHeap::new(),
            closed_occupancy: OccupancyStats::default(),
            non_lsa_occupancy: OccupancyStats::default(),
            evictable_space: 0,
            evictable_grounded: false,
            evictable: false,
            eviction_fn: None,
            invalidate_counter: 0,
            sanitizer: RegionSanitizer::new(report_backtrace),
            listener,
            buf_scratch: Vec::with_capacity(SEGMENT_SIZE / BUF_ALIGN),
        }
    }

    /// Bump-allocates from the active segment. Returns `None` when a new
    /// segment is needed; a full active segment is closed on the way out.
    fn try_alloc_small(
        &mut self,
        pool: &mut SegmentPool,
        header: u64,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let idx = self.active?;
        let header_size = vle::encoded_size(header);
        let obj_offset = align_up(self.active_offset + header_size, align);
        if obj_offset + size > SEGMENT_SIZE {
            self.close_active(pool);
            return None;
        }
        let base = pool.segment_base(idx);
        // The header is widened to fill the alignment gap exactly.
        // Safety: offsets stay within the segment.
        let payload = unsafe {
            vle::encode_with_width(
                base.add(self.active_offset),
                header,
                obj_offset - self.active_offset,
            )
        };
        let old_offset = self.active_offset;
        self.active_offset = obj_offset + size;
        pool.desc_mut(idx).record_alloc(self.active_offset - old_offset);
        NonNull::new(payload)
    }

    /// Closes the active segment into the heap, sealing the tail with a
    /// dead header so forward walks stay in bounds.
    pub(crate) fn close_active(&mut self, pool: &mut SegmentPool) {
        let Some(idx) = self.active.take() else {
            return;
        };
        if self.active_offset < SEGMENT_SIZE {
            // Safety: the tail is unused segment memory.
            unsafe {
                vle::encode(
                    pool.segment_base(idx).add(self.active_offset),
                    2 * (SEGMENT_SIZE - self.active_offset) as u64,
                );
            }
        }
        trace!(
            "closing segment {}, used={}, waste={} [B]",
            idx,
            pool.desc(idx).occupancy(),
            SEGMENT_SIZE - self.active_offset
        );
        self.closed_occupancy += pool.desc(idx).occupancy();
        self.heap.push(pool.descs_mut(), idx);
    }

    /// Closes the active buffer segment into the heap.
    pub(crate) fn close_buf_active(&mut self, pool: &mut SegmentPool) {
        let Some(idx) = self.buf_active.take() else {
            return;
        };
        trace!(
            "closing buf segment {}, used={}, waste={} [B]",
            idx,
            pool.desc(idx).occupancy(),
            SEGMENT_SIZE - self.buf_active_offset
        );
        self.closed_occupancy += pool.desc(idx).occupancy();
        self.heap.push(pool.descs_mut(), idx);
    }
}

/// Returns a region-held segment to the pool's free set and reports the
/// usage drop.
fn free_region_segment(
    pool: &mut SegmentPool,
    r: &mut RegionInner,
    rid: RegionId,
    idx: SegmentIdx,
) {
    pool.free_segment(idx);
    if let Some(listener) = r.listener.clone() {
        r.evictable_space -= SEGMENT_SIZE;
        listener.on_usage_change(rid, -(SEGMENT_SIZE as isize));
    }
}

/// Restores a region's reclaim flag on drop. Forces references into the
/// region to stay valid for the guard's lifetime by keeping compaction and
/// eviction away. Nests.
pub(crate) struct RegionReclaimGuard<'a> {
    tracker: &'a Tracker,
    rid: RegionId,
    prev: bool,
}

impl<'a> RegionReclaimGuard<'a> {
    pub(crate) fn new(tracker: &'a Tracker, rid: RegionId) -> Self {
        let mut st = tracker.state.borrow_mut();
        let r = st.regions.get_mut(&rid).expect("region not registered");
        let prev = std::mem::replace(&mut r.reclaiming_enabled, false);
        Self { tracker, rid, prev }
    }
}

impl Drop for RegionReclaimGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.tracker.state.borrow_mut();
        if let Some(r) = st.regions.get_mut(&self.rid) {
            r.reclaiming_enabled = self.prev;
        }
    }
}

impl Tracker {
    pub(crate) fn register_region(&self, inner: RegionInner) {
        let rid = inner.id;
        let mut st = self.state.borrow_mut();
        st.region_order.push(rid);
        st.regions.insert(rid, inner);
        debug!("registered region id={}", rid);
    }

    /// Obtains a fresh segment for the region's given bump stream, running
    /// the full allocation path (free list, host, compact-and-evict).
    fn ensure_segment(&self, rid: RegionId, kind: SegmentKind) -> MemResult<()> {
        let goal = self.state.borrow().pool.current_emergency_reserve_goal();
        let Some(idx) = self.allocate_segment(goal) else {
            self.state.borrow_mut().pool.set_allocation_failure_flag();
            return Err(MemError::OutOfMemory {
                bytes: SEGMENT_SIZE,
            });
        };
        let mut st = self.state.borrow_mut();
        Self::install_segment(&mut st, rid, idx, kind);
        Ok(())
    }

    fn install_segment(st: &mut TrackerState, rid: RegionId, idx: SegmentIdx, kind: SegmentKind) {
        let st = &mut *st;
        st.pool.install_segment(idx, rid, kind);
        let r = st.regions.get_mut(&rid).expect("region not registered");
        match kind {
            SegmentKind::Regular => {
                debug_assert!(r.active.is_none());
                r.active = Some(idx);
                r.active_offset = 0;
            }
            SegmentKind::Bufs => {
                // Claiming the segment may have run compaction, which can
                // re-enter the buffer allocator and open a buf segment of
                // its own; retire it and use the fresh one.
                if r.buf_active.is_some() {
                    r.close_buf_active(&mut st.pool);
                }
                // Sized so registering one back-reference per buffer slot
                // can never reallocate.
                st.pool.desc_mut(idx).buf_backrefs =
                    Vec::with_capacity(SEGMENT_SIZE / BUF_ALIGN);
                r.buf_active = Some(idx);
                r.buf_active_offset = 0;
            }
        }
        if let Some(listener) = r.listener.clone() {
            r.evictable_space += SEGMENT_SIZE;
            listener.on_usage_change(rid, SEGMENT_SIZE as isize);
        }
    }

    /// Segment acquisition inside compaction: only the free set and the
    /// host budget are eligible; reclaim is already in progress above us.
    fn install_segment_from_reserve(st: &mut TrackerState, rid: RegionId, kind: SegmentKind) {
        let goal = st.pool.current_emergency_reserve_goal();
        let idx = st
            .pool
            .try_take_free(goal)
            .or_else(|| st.pool.try_allocate_from_host())
            .unwrap_or_else(|| panic!("segment reserve exhausted during compaction"));
        Self::install_segment(st, rid, idx, kind);
    }

    pub(crate) fn region_alloc(
        &self,
        rid: RegionId,
        migrator_id: MigratorId,
        size: usize,
        align: usize,
    ) -> MemResult<NonNull<u8>> {
        assert!(size > 0, "zero-sized allocation");
        assert!(
            align.is_power_of_two() && align <= SEGMENT_SIZE,
            "bad alignment {}",
            align
        );
        // Fail fast on unregistered IDs; compaction depends on the lookup.
        let _ = migrator(migrator_id);
        let _guard = RegionReclaimGuard::new(self, rid);
        self.state.borrow_mut().pool.on_memory_allocation(size);
        if size > MAX_MANAGED_OBJECT_SIZE {
            return self.alloc_large(rid, size, align);
        }
        let header = u64::from(migrator_id.as_u32()) * 2 + 1;
        loop {
            let attempt = {
                let mut st = self.state.borrow_mut();
                let st = &mut *st;
                let r = st.regions.get_mut(&rid).expect("region not registered");
                r.try_alloc_small(&mut st.pool, header, size, align)
            };
            match attempt {
                Some(payload) => {
                    let mut st = self.state.borrow_mut();
                    st.regions
                        .get_mut(&rid)
                        .expect("region not registered")
                        .sanitizer
                        .on_allocation(payload.as_ptr(), size);
                    return Ok(payload);
                }
                None => self.ensure_segment(rid, SegmentKind::Regular)?,
            }
        }
    }

    /// Large objects go straight to the host allocator, wrapped with a size
    /// prefix and a trailing cookie, and accounted separately.
    fn alloc_large(&self, rid: RegionId, size: usize, align: usize) -> MemResult<NonNull<u8>> {
        let prefix = align.max(NON_LSA_MIN_PREFIX);
        let allocated_size = prefix + size + std::mem::size_of::<u64>();

        // Emulated host pressure: reclaim until the budget covers it.
        loop {
            let free = self.state.borrow().pool.free_memory();
            if free >= allocated_size {
                break;
            }
            let step = self.reclamation_step();
            let want = (allocated_size - free).max(step * SEGMENT_SIZE);
            if self.reclaim_inner(want, IsPreemptible::No) == 0 {
                return Err(MemError::OutOfMemory { bytes: size });
            }
        }

        let layout = Layout::from_size_align(allocated_size, prefix).unwrap();
        // Safety: layout has non-zero size.
        let base = unsafe { host_alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            return Err(MemError::OutOfMemory { bytes: size });
        };
        // Safety: prefix >= 16, so the two records fit in front of the
        // payload; the cookie lands inside the allocation's tail.
        let payload = unsafe {
            let payload = base.as_ptr().add(prefix);
            ptr::write_unaligned(payload.sub(16).cast::<u64>(), allocated_size as u64);
            ptr::write_unaligned(payload.sub(8).cast::<u64>(), prefix as u64);
            ptr::write_unaligned(payload.add(size).cast::<u64>(), NON_LSA_COOKIE);
            payload
        };

        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        st.pool.add_non_lsa_memory_in_use(allocated_size);
        let r = st.regions.get_mut(&rid).expect("region not registered");
        r.non_lsa_occupancy += OccupancyStats::new(0, allocated_size);
        if let Some(listener) = r.listener.clone() {
            r.evictable_space += allocated_size;
            listener.on_usage_change(rid, allocated_size as isize);
        }
        Ok(NonNull::new(payload).unwrap())
    }

    pub(crate) fn region_free(&self, rid: RegionId, obj: *mut u8, size: Option<usize>) {
        let _guard = RegionReclaimGuard::new(self, rid);
        let seg = self.state.borrow().pool.containing_segment(obj);
        let Some(idx) = seg else {
            return self.free_non_lsa(rid, obj);
        };

        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let r = st.regions.get_mut(&rid).expect("region not registered");

        // Safety: obj is a live payload pointer, so the bytes before it
        // hold its header.
        let (header, header_start) = unsafe { vle::decode_backwards(obj) };
        debug_assert!(header & 1 == 1, "freeing a dead object");
        let size = size
            .unwrap_or_else(|| migrator(MigratorId::new((header / 2) as u32)).size(obj));
        r.sanitizer.on_free(obj, size);

        let header_len = obj as usize - header_start as usize;
        let dead_size = size + header_len;
        // Safety: the dead header is written over the start of the dead
        // range, which is always wide enough to hold it.
        unsafe { vle::encode(header_start.cast_mut(), 2 * dead_size as u64) };

        let is_active = r.active == Some(idx);
        if !is_active {
            r.closed_occupancy -= st.pool.desc(idx).occupancy();
        }
        st.pool.desc_mut(idx).record_free(dead_size);
        st.pool.on_memory_deallocation(dead_size);
        if !is_active {
            if st.pool.desc(idx).is_empty() {
                r.heap.remove(st.pool.descs_mut(), idx);
                free_region_segment(&mut st.pool, r, rid, idx);
            } else {
                r.heap.adjust(st.pool.descs_mut(), idx);
                r.closed_occupancy += st.pool.desc(idx).occupancy();
            }
        }
    }

    fn free_non_lsa(&self, rid: RegionId, obj: *mut u8) {
        // Safety: obj came from alloc_large, which wrote the records.
        let (allocated_size, prefix) = unsafe {
            (
                ptr::read_unaligned(obj.sub(16).cast::<u64>()) as usize,
                ptr::read_unaligned(obj.sub(8).cast::<u64>()) as usize,
            )
        };
        let size = allocated_size - prefix - std::mem::size_of::<u64>();
        let cookie = unsafe { ptr::read_unaligned(obj.add(size).cast::<u64>()) };
        assert_eq!(cookie, NON_LSA_COOKIE, "freeing a corrupted large object");

        {
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            st.pool.subtract_non_lsa_memory_in_use(allocated_size);
            let r = st.regions.get_mut(&rid).expect("region not registered");
            r.non_lsa_occupancy -= OccupancyStats::new(0, allocated_size);
            if let Some(listener) = r.listener.clone() {
                r.evictable_space -= allocated_size;
                listener.on_usage_change(rid, -(allocated_size as isize));
            }
        }
        let layout = Layout::from_size_align(allocated_size, prefix).unwrap();
        // Safety: matches the allocation in alloc_large.
        unsafe { host_dealloc(obj.sub(prefix), layout) };
    }

    pub(crate) fn region_alloc_buf(&self, rid: RegionId, size: usize) -> MemResult<LsaBuffer> {
        if size > SEGMENT_SIZE {
            return Err(MemError::BufferTooLarge {
                size,
                max_size: SEGMENT_SIZE,
            });
        }
        // No reclaim guard here: claiming a segment below may legitimately
        // compact this region's own buffer segments.
        loop {
            let done = {
                let mut st = self.state.borrow_mut();
                let st = &mut *st;
                let r = st.regions.get_mut(&rid).expect("region not registered");
                match r.buf_active {
                    Some(idx) if r.buf_active_offset + size <= SEGMENT_SIZE => {
                        // Safety: the slot is inside the segment.
                        let buf = unsafe {
                            st.pool.segment_base(idx).add(r.buf_active_offset)
                        };
                        let desc = st.pool.desc_mut(idx);
                        let rec = Box::into_raw(Box::new(BufRecord {
                            buf,
                            size,
                            seg: idx,
                            slot: desc.buf_backrefs.len(),
                        }));
                        desc.buf_backrefs.push(rec);
                        let alloc_size = align_up(size, BUF_ALIGN);
                        desc.record_alloc(alloc_size);
                        r.buf_active_offset += alloc_size;
                        Some(LsaBuffer::engage(rec))
                    }
                    Some(_) => {
                        r.close_buf_active(&mut st.pool);
                        None
                    }
                    None => None,
                }
            };
            match done {
                Some(buffer) => return Ok(buffer),
                None => self.ensure_segment(rid, SegmentKind::Bufs)?,
            }
        }
    }

    /// Frees an engaged buffer. The owning region is derived from the
    /// segment descriptor, which stays correct across merges.
    pub(crate) fn free_buf(&self, rec: &mut BufRecord) {
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let idx = rec.seg;
        let rid = st
            .pool
            .desc(idx)
            .region
            .expect("buffer segment no region owns");
        let r = st.regions.get_mut(&rid).expect("region not registered");

        let is_active = r.buf_active == Some(idx);
        if !is_active {
            r.closed_occupancy -= st.pool.desc(idx).occupancy();
        }

        let alloc_size = align_up(rec.size, BUF_ALIGN);
        let desc = st.pool.desc_mut(idx);
        desc.record_free(alloc_size);

        // Pack the table so compaction only walks live buffers.
        let slot = rec.slot;
        desc.buf_backrefs.swap_remove(slot);
        if slot < desc.buf_backrefs.len() {
            // Safety: entries are engaged records owned by live handles.
            unsafe { (*desc.buf_backrefs[slot]).slot = slot };
        }

        if !is_active {
            if st.pool.desc(idx).is_empty() {
                debug_assert!(st.pool.desc(idx).buf_backrefs.is_empty());
                r.heap.remove(st.pool.descs_mut(), idx);
                free_region_segment(&mut st.pool, r, rid, idx);
            } else {
                r.heap.adjust(st.pool.descs_mut(), idx);
                r.closed_occupancy += st.pool.desc(idx).occupancy();
            }
        }
    }

    /// Compacts the region's sparsest closed segment.
    pub(crate) fn region_compact_one(&self, rid: RegionId) {
        let _guard = RegionReclaimGuard::new(self, rid);
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let r = st.regions.get_mut(&rid).expect("region not registered");
        let Some(idx) = r.heap.pop_sparsest(st.pool.descs_mut()) else {
            return;
        };
        r.closed_occupancy -= st.pool.desc(idx).occupancy();
        Self::compact_segment_locked(st, rid, idx);
    }

    /// Compacts one specific segment, closing it out of the bump streams
    /// first if needed. Driven by the pool's bottom-up segment reclaim.
    pub(crate) fn region_compact_segment(&self, rid: RegionId, idx: SegmentIdx) {
        let _guard = RegionReclaimGuard::new(self, rid);
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let r = st.regions.get_mut(&rid).expect("region not registered");
        if r.active == Some(idx) {
            r.close_active(&mut st.pool);
        } else if r.buf_active == Some(idx) {
            r.close_buf_active(&mut st.pool);
        }
        r.heap.remove(st.pool.descs_mut(), idx);
        r.closed_occupancy -= st.pool.desc(idx).occupancy();
        Self::compact_segment_locked(st, rid, idx);
    }

    /// Moves every live object out of `idx` and frees it. The segment must
    /// already be detached from the heap and the occupancy totals.
    fn compact_segment_locked(st: &mut TrackerState, rid: RegionId, idx: SegmentIdx) {
        let seg_occupancy = st.pool.desc(idx).occupancy();
        debug!("compacting segment {} from region {}, {}", idx, rid, seg_occupancy);
        st.regions
            .get_mut(&rid)
            .expect("region not registered")
            .invalidate_counter += 1;

        match st.pool.desc(idx).kind() {
            SegmentKind::Bufs => {
                // Moving the table into the region scratch releases the
                // previous scratch storage, which keeps the buffer
                // allocator below from failing on its own table.
                let backrefs = std::mem::take(&mut st.pool.desc_mut(idx).buf_backrefs);
                st.regions.get_mut(&rid).unwrap().buf_scratch = backrefs;
                let count = st.regions[&rid].buf_scratch.len();
                for i in 0..count {
                    let rec_ptr = st.regions[&rid].buf_scratch[i];
                    // Safety: entries are engaged records owned by live
                    // handles; the handle cannot be touched concurrently.
                    let rec = unsafe { &mut *rec_ptr };
                    debug_assert_eq!(rec.seg, idx);
                    let (new_buf, new_seg, new_slot) =
                        Self::alloc_buf_for_compaction(st, rid, rec_ptr, rec.size);
                    // Safety: source and destination are distinct segments.
                    unsafe { ptr::copy_nonoverlapping(rec.buf, new_buf, rec.size) };
                    rec.buf = new_buf;
                    rec.seg = new_seg;
                    rec.slot = new_slot;
                }
            }
            SegmentKind::Regular => {
                let base = st.pool.segment_base(idx);
                let mut pos = base.cast_const();
                // Safety: the walk below stays within the segment: live
                // headers are followed by their payload, dead headers
                // carry the distance to the next one.
                let end = unsafe { base.add(SEGMENT_SIZE) }.cast_const();
                while pos < end {
                    let start = pos;
                    let (header, payload) = unsafe { vle::decode_forwards(pos) };
                    if header & 1 == 1 {
                        let m = migrator(MigratorId::new((header / 2) as u32));
                        let size = m.size(payload);
                        let dst =
                            Self::alloc_small_for_compaction(st, rid, header, size, m.align());
                        st.regions
                            .get_mut(&rid)
                            .unwrap()
                            .sanitizer
                            .on_migrate(payload, size, dst.as_ptr());
                        // Safety: payload is live, dst is fresh storage of
                        // the right size and alignment.
                        unsafe { m.migrate(payload.cast_mut(), dst.as_ptr(), size) };
                        pos = unsafe { payload.add(size) };
                    } else {
                        pos = unsafe { start.add((header / 2) as usize) };
                    }
                }
            }
        }

        let st = &mut *st;
        let r = st.regions.get_mut(&rid).expect("region not registered");
        free_region_segment(&mut st.pool, r, rid, idx);
        st.pool.on_segment_compaction(seg_occupancy.used_space());
    }

    fn alloc_small_for_compaction(
        st: &mut TrackerState,
        rid: RegionId,
        header: u64,
        size: usize,
        align: usize,
    ) -> NonNull<u8> {
        loop {
            {
                let st = &mut *st;
                let r = st.regions.get_mut(&rid).expect("region not registered");
                if let Some(payload) = r.try_alloc_small(&mut st.pool, header, size, align) {
                    return payload;
                }
            }
            Self::install_segment_from_reserve(st, rid, SegmentKind::Regular);
        }
    }

    fn alloc_buf_for_compaction(
        st: &mut TrackerState,
        rid: RegionId,
        rec_ptr: *mut BufRecord,
        size: usize,
    ) -> (*mut u8, SegmentIdx, usize) {
        loop {
            {
                let st = &mut *st;
                let r = st.regions.get_mut(&rid).expect("region not registered");
                if let Some(idx) = r.buf_active {
                    if r.buf_active_offset + size <= SEGMENT_SIZE {
                        // Safety: the slot is inside the segment.
                        let buf =
                            unsafe { st.pool.segment_base(idx).add(r.buf_active_offset) };
                        let desc = st.pool.desc_mut(idx);
                        let slot = desc.buf_backrefs.len();
                        desc.buf_backrefs.push(rec_ptr);
                        desc.record_alloc(align_up(size, BUF_ALIGN));
                        r.buf_active_offset += align_up(size, BUF_ALIGN);
                        return (buf, idx, slot);
                    }
                    r.close_buf_active(&mut st.pool);
                }
            }
            Self::install_segment_from_reserve(st, rid, SegmentKind::Bufs);
        }
    }

    /// Compacts every closed segment of the region. Mainly for testing.
    /// Invalidates references to allocated objects.
    pub(crate) fn region_full_compaction(&self, rid: RegionId) {
        let _guard = RegionReclaimGuard::new(self, rid);
        debug!("full compaction of region {}", rid);
        let mut all = {
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            let r = st.regions.get_mut(&rid).expect("region not registered");
            r.close_active(&mut st.pool);
            r.close_buf_active(&mut st.pool);
            r.closed_occupancy = OccupancyStats::default();
            std::mem::take(&mut r.heap)
        };
        loop {
            // Keep two segments of headroom per bump stream so the move
            // below cannot run the pool dry.
            self.reserve_free_segments(4);
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            let Some(idx) = all.pop_sparsest(st.pool.descs_mut()) else {
                break;
            };
            Self::compact_segment_locked(st, rid, idx);
        }
        debug!("full compaction of region {} done", rid);
    }

    /// Merges `src` into `dst`, leaving `src` registered but empty.
    /// Doesn't invalidate references to allocated objects.
    pub(crate) fn region_merge(&self, dst: RegionId, src: RegionId) {
        if dst == src {
            return;
        }
        let _g1 = RegionReclaimGuard::new(self, dst);
        let _g2 = RegionReclaimGuard::new(self, src);

        // Step the listeners aside for the duration: totals are re-added
        // from post-merge occupancies.
        let (dst_listener, dst_total, src_listener, src_total) = {
            let st = self.state.borrow();
            (
                st.regions[&dst].listener.clone(),
                st.region_occupancy_of(dst).total_space(),
                st.regions[&src].listener.clone(),
                st.region_occupancy_of(src).total_space(),
            )
        };
        if let Some(listener) = &dst_listener {
            listener.on_del(dst, dst_total);
        }
        if let Some(listener) = &src_listener {
            listener.on_del(src, src_total);
        }

        {
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            let mut donor = st.regions.remove(&src).expect("region not registered");
            let d = st.regions.get_mut(&dst).expect("region not registered");
            d.listener = None;
            donor.listener = None;

            // An empty active segment on the winner is dead weight; take
            // the donor's instead so object identity is preserved.
            if let Some(idx) = d.active {
                if st.pool.desc(idx).is_empty() {
                    st.pool.free_segment(idx);
                    if dst_listener.is_some() {
                        d.evictable_space -= SEGMENT_SIZE;
                    }
                    d.active = None;
                }
            }
            if d.active.is_none() {
                d.active = donor.active.take();
                d.active_offset = donor.active_offset;
                if let Some(idx) = d.active {
                    st.pool.desc_mut(idx).region = Some(dst);
                }
            } else {
                donor.close_active(&mut st.pool);
            }
            donor.close_buf_active(&mut st.pool);

            donor.heap.drain_into(st.pool.descs_mut(), &mut d.heap, dst);

            d.closed_occupancy += donor.closed_occupancy;
            d.non_lsa_occupancy += donor.non_lsa_occupancy;
            donor.closed_occupancy = OccupancyStats::default();
            donor.non_lsa_occupancy = OccupancyStats::default();
            d.evictable_space += donor.evictable_space;
            donor.evictable_space = 0;

            // Make sure both regions notice a future reclaim.
            d.invalidate_counter = d.invalidate_counter.max(donor.invalidate_counter);
            d.sanitizer.merge(&mut donor.sanitizer);

            d.listener = dst_listener.clone();
            donor.listener = src_listener.clone();
            st.regions.insert(src, donor);
        }

        let (dst_total, src_total) = {
            let st = self.state.borrow();
            (
                st.region_occupancy_of(dst).total_space(),
                st.region_occupancy_of(src).total_space(),
            )
        };
        if let Some(listener) = &dst_listener {
            listener.on_add(dst, dst_total);
        }
        if let Some(listener) = &src_listener {
            listener.on_add(src, src_total);
        }
    }

    /// Runs the region's eviction callback once, with the allocator
    /// unlocked so the callback can free objects.
    pub(crate) fn evict_some_internal(&self, rid: RegionId) -> EvictionResult {
        let (eviction_fn, freed_before) = {
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            let r = st.regions.get_mut(&rid).expect("region not registered");
            r.invalidate_counter += 1;
            let Some(eviction_fn) = r.eviction_fn.clone() else {
                return EvictionResult::Nothing;
            };
            (eviction_fn, st.pool.statistics().memory_freed)
        };
        let result = eviction_fn();
        {
            let mut st = self.state.borrow_mut();
            let freed = st.pool.statistics().memory_freed - freed_before;
            st.pool.on_memory_eviction(freed as usize);
        }
        result
    }

    pub(crate) fn region_invalidate_references(&self, rid: RegionId) {
        let mut st = self.state.borrow_mut();
        if let Some(r) = st.regions.get_mut(&rid) {
            r.invalidate_counter += 1;
        }
    }

    fn region_teardown(&self, rid: RegionId) {
        let (listener, total) = {
            let st = self.state.borrow();
            (
                st.regions[&rid].listener.clone(),
                st.region_occupancy_of(rid).total_space(),
            )
        };
        if let Some(listener) = listener {
            listener.on_del(rid, total);
        }
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let mut r = st.regions.remove(&rid).expect("region not registered");
        st.region_order.retain(|&other| other != rid);
        r.listener = None;
        r.sanitizer.on_region_destruction();
        let check = !std::thread::panicking();
        while let Some(idx) = r.heap.pop_sparsest(st.pool.descs_mut()) {
            if check {
                assert!(
                    st.pool.desc(idx).is_empty(),
                    "region {} destroyed with live objects",
                    rid
                );
            }
            st.pool.free_segment(idx);
        }
        for idx in [r.active.take(), r.buf_active.take()].into_iter().flatten() {
            if check {
                assert!(
                    st.pool.desc(idx).is_empty(),
                    "region {} destroyed with live objects",
                    rid
                );
            }
            st.pool.free_segment(idx);
        }
        debug!("unregistered region id={}", rid);
    }
}

/// A log-structured allocator region.
///
/// Objects allocated through a region are owned by it and must be freed
/// through the region that owns them; ownership moves wholesale with
/// [`merge`](Region::merge). The region must outlive all of its objects and
/// buffers, and is registered with its worker's tracker for the whole of
/// its life, making it eligible for compaction and eviction unless reclaim
/// is disabled.
///
/// Regions are `!Send`: every region is pinned to the worker that created
/// it.
pub struct Region {
    tracker: Rc<Tracker>,
    id: RegionId,
}

impl Region {
    /// Creates a region on this worker.
    #[must_use]
    pub fn new() -> Self {
        Self::create(None)
    }

    /// Creates a region whose memory footprint is reported to `listener`.
    #[must_use]
    pub fn with_listener(listener: Rc<dyn RegionListener>) -> Self {
        Self::create(Some(listener))
    }

    fn create(listener: Option<Rc<dyn RegionListener>>) -> Self {
        let tracker = worker_tracker();
        let id = RegionId::new(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed));
        let report_backtrace = tracker.state.borrow().sanitizer_report_backtrace;
        tracker.register_region(RegionInner::new(id, listener.clone(), report_backtrace));
        if let Some(listener) = listener {
            listener.on_add(id, 0);
        }
        Self { tracker, id }
    }

    /// The region's identifier.
    #[must_use]
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Allocates an object of `size` bytes with the given alignment,
    /// relocatable through the registered migrator. Returns a pointer to
    /// uninitialized payload storage.
    ///
    /// The pointer stays valid until the object is freed, compacted, or
    /// evicted; compaction hands it to the migrator.
    pub fn alloc(
        &self,
        migrator_id: MigratorId,
        size: usize,
        align: usize,
    ) -> MemResult<NonNull<u8>> {
        self.tracker.region_alloc(self.id, migrator_id, size, align)
    }

    /// Frees an object, recovering its size from the header.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object allocated from this region.
    pub unsafe fn free(&self, obj: *mut u8) {
        self.tracker.region_free(self.id, obj, None);
    }

    /// Frees an object of known size.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object of `size` bytes allocated from this
    /// region.
    pub unsafe fn free_sized(&self, obj: *mut u8, size: usize) {
        self.tracker.region_free(self.id, obj, Some(size));
    }

    /// Allocates a buffer of the given size, 4 KiB-aligned.
    ///
    /// Sizes that are not a multiple of the alignment waste the remainder
    /// of their last block.
    pub fn alloc_buf(&self, size: usize) -> MemResult<LsaBuffer> {
        self.tracker.region_alloc_buf(self.id, size)
    }

    /// Memory consumed by an object inside the allocator, header included.
    ///
    /// # Safety
    ///
    /// `obj` must be a live object allocated from this region.
    #[must_use]
    pub unsafe fn object_memory_size(&self, obj: *const u8) -> usize {
        let seg = self.tracker.state.borrow().pool.containing_segment(obj);
        match seg {
            Some(_) => {
                // Safety: live payload pointers have a header behind them.
                let (header, header_start) = unsafe { vle::decode_backwards(obj) };
                let size = migrator(MigratorId::new((header / 2) as u32)).size(obj);
                size + (obj as usize - header_start as usize)
            }
            // Safety: non-segment objects carry their size prefix.
            None => unsafe { ptr::read_unaligned(obj.sub(16).cast::<u64>()) as usize },
        }
    }

    /// This region's occupancy.
    #[must_use]
    pub fn occupancy(&self) -> OccupancyStats {
        self.tracker.state.borrow().region_occupancy_of(self.id)
    }

    /// Compacts everything in this region. Mainly for testing.
    /// Invalidates references to allocated objects.
    pub fn full_compaction(&self) {
        self.tracker.region_full_compaction(self.id);
    }

    /// Merges another region into this one. The other region is left
    /// registered but empty; all its objects now belong to this region.
    /// Doesn't invalidate references to allocated objects.
    pub fn merge(&self, other: &Region) {
        self.tracker.region_merge(self.id, other.id);
    }

    /// Makes this region evictable: the supplied function is called when
    /// data must be discarded to reclaim space, and should free some
    /// objects from this region.
    ///
    /// The eviction loop terminates as long as repeated calls eventually
    /// report [`EvictionResult::Nothing`] when no new objects are added.
    pub fn make_evictable(&self, eviction_fn: impl Fn() -> EvictionResult + 'static) {
        let mut st = self.tracker.state.borrow_mut();
        let r = st.regions.get_mut(&self.id).expect("region not registered");
        r.evictable = true;
        r.eviction_fn = Some(Rc::new(eviction_fn));
    }

    /// Withdraws the eviction function, making the region non-evictable.
    pub fn make_not_evictable(&self) {
        let mut st = self.tracker.state.borrow_mut();
        let r = st.regions.get_mut(&self.id).expect("region not registered");
        r.evictable = false;
        r.eviction_fn = None;
    }

    /// Runs the eviction function once. Mainly for testing.
    pub fn evict_some(&self) -> EvictionResult {
        let evictable = self.tracker.state.borrow().is_evictable(self.id);
        if !evictable {
            return EvictionResult::Nothing;
        }
        self.tracker.evict_some_internal(self.id)
    }

    /// Changes this region's reclaimability. While disabled, the region is
    /// not considered by the tracker's reclaim and references stay valid.
    /// Regions are reclaimable after construction.
    pub fn set_reclaiming_enabled(&self, enabled: bool) {
        let mut st = self.tracker.state.borrow_mut();
        let r = st.regions.get_mut(&self.id).expect("region not registered");
        r.reclaiming_enabled = enabled;
    }

    /// This region's reclaimability.
    #[must_use]
    pub fn reclaiming_enabled(&self) -> bool {
        self.tracker.state.borrow().regions[&self.id].reclaiming_enabled
    }

    /// A value which increases whenever this region is compacted or evicted
    /// from, which invalidates references into the region. While the value
    /// stays put, references remain valid.
    #[must_use]
    pub fn reclaim_counter(&self) -> u64 {
        self.tracker.state.borrow().regions[&self.id].invalidate_counter
    }

    /// Coarse-grained occupancy reported to the region's listener; zero
    /// after [`ground_evictable_occupancy`](Self::ground_evictable_occupancy).
    #[must_use]
    pub fn evictable_occupancy(&self) -> OccupancyStats {
        let st = self.tracker.state.borrow();
        let r = &st.regions[&self.id];
        let space = if r.evictable_grounded {
            0
        } else {
            r.evictable_space
        };
        OccupancyStats::new(0, space)
    }

    /// Makes subsequent [`evictable_occupancy`](Self::evictable_occupancy)
    /// calls report empty occupancy.
    pub fn ground_evictable_occupancy(&self) {
        let listener = {
            let mut st = self.tracker.state.borrow_mut();
            let r = st.regions.get_mut(&self.id).expect("region not registered");
            r.evictable_grounded = true;
            r.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_evictable_grounded(self.id);
        }
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.tracker.region_teardown(self.id);
    }
}

/// Forces references into the region to remain valid as long as this guard
/// is live by disabling compaction and eviction. Can be nested.
pub struct ReclaimLock<'a> {
    region: &'a Region,
    prev: bool,
}

impl<'a> ReclaimLock<'a> {
    /// Disables reclaim on the region until the guard drops.
    pub fn new(region: &'a Region) -> Self {
        let prev = region.reclaiming_enabled();
        region.set_reclaiming_enabled(false);
        Self { region, prev }
    }
}

impl Drop for ReclaimLock<'_> {
    fn drop(&mut self) {
        self.region.set_reclaiming_enabled(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrator::{register_migrator, Migrator};

    struct Raw {
        size: usize,
        align: usize,
    }

    impl Migrator for Raw {
        fn align(&self) -> usize {
            self.align
        }

        fn size(&self, _obj: *const u8) -> usize {
            self.size
        }

        unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
            unsafe { ptr::copy_nonoverlapping(src, dst, size) };
        }
    }

    #[test]
    fn test_alloc_write_free() {
        let reg = register_migrator(Rc::new(Raw { size: 24, align: 8 }));
        let region = Region::new();
        let ptr = region.alloc(reg.id(), 24, 8).unwrap();
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0xab, 24) };
        assert!(region.occupancy().used_space() >= 24);
        unsafe { region.free_sized(ptr.as_ptr(), 24) };
        assert_eq!(region.occupancy().used_space(), 0);
    }

    #[test]
    fn test_free_without_size_decodes_header() {
        let reg = register_migrator(Rc::new(Raw { size: 37, align: 8 }));
        let region = Region::new();
        let ptr = region.alloc(reg.id(), 37, 8).unwrap();
        unsafe { region.free(ptr.as_ptr()) };
        assert_eq!(region.occupancy().used_space(), 0);
    }

    #[test]
    fn test_object_memory_size_includes_header() {
        let reg = register_migrator(Rc::new(Raw { size: 37, align: 8 }));
        let region = Region::new();
        let ptr = region.alloc(reg.id(), 37, 8).unwrap();
        let total = unsafe { region.object_memory_size(ptr.as_ptr()) };
        assert!(total > 37);
        assert!(total <= 37 + 8);
        unsafe { region.free(ptr.as_ptr()) };
    }

    #[test]
    fn test_large_alloc_goes_to_host() {
        let reg = register_migrator(Rc::new(Raw { size: 0, align: 8 }));
        let region = Region::new();
        let size = MAX_MANAGED_OBJECT_SIZE + 1;
        let ptr = region.alloc(reg.id(), size, 16).unwrap();
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0x5a, size) };
        assert!(region.occupancy().used_space() >= size);
        assert!(worker_tracker().non_lsa_used_space() > 0);
        unsafe { region.free(ptr.as_ptr()) };
        assert_eq!(region.occupancy().used_space(), 0);
        assert_eq!(worker_tracker().non_lsa_used_space(), 0);
    }

    #[test]
    fn test_reclaim_lock_restores() {
        let region = Region::new();
        assert!(region.reclaiming_enabled());
        {
            let _outer = ReclaimLock::new(&region);
            assert!(!region.reclaiming_enabled());
            {
                let _inner = ReclaimLock::new(&region);
                assert!(!region.reclaiming_enabled());
            }
            assert!(!region.reclaiming_enabled());
        }
        assert!(region.reclaiming_enabled());
    }

    #[test]
    fn test_merge_moves_objects() {
        let reg = register_migrator(Rc::new(Raw { size: 16, align: 8 }));
        let winner = Region::new();
        let donor = Region::new();
        let ptr = donor.alloc(reg.id(), 16, 8).unwrap();
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0x11, 16) };

        winner.merge(&donor);
        assert_eq!(donor.occupancy().used_space(), 0);
        assert!(winner.occupancy().used_space() >= 16);
        // The object is still where it was, now owned by the winner.
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0x11);
        unsafe { winner.free(ptr.as_ptr()) };
    }
}
