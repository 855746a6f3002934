//! Tracker-driven reclamation: eviction policy, preemption, reentrancy,
//! and idle compaction.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use logmem_alloc::{
    preempt, EvictionResult, IdleCpuResult, Region, TrackerConfig, SEGMENT_SIZE,
};
use logmem_test::{chase, register_bytes, TrackingMigrator};

/// Size chosen so ten objects nearly fill one segment.
const DENSE_OBJECT: usize = 13_000;

/// Fills the region with FIFO-evictable objects and returns the shared
/// queue the evictor drains. Eviction order matches allocation order, so
/// the oldest segments empty first.
fn fill_evictable(
    region: &Rc<Region>,
    reg: &logmem_alloc::MigratorRegistration,
    count: usize,
) -> Rc<RefCell<VecDeque<usize>>> {
    let queue: Rc<RefCell<VecDeque<usize>>> = Rc::new(RefCell::new(VecDeque::new()));
    let evictor_queue = Rc::clone(&queue);
    let evictor_region = Rc::clone(region);
    region.make_evictable(move || {
        match evictor_queue.borrow_mut().pop_front() {
            Some(addr) => {
                unsafe { evictor_region.free_sized(addr as *mut u8, DENSE_OBJECT) };
                EvictionResult::Evicted
            }
            None => EvictionResult::Nothing,
        }
    });
    for _ in 0..count {
        let ptr = region.alloc(reg.id(), DENSE_OBJECT, 8).unwrap();
        queue.borrow_mut().push_back(ptr.as_ptr() as usize);
    }
    queue
}

fn drain(region: &Region, queue: &Rc<RefCell<VecDeque<usize>>>) {
    while let Some(addr) = queue.borrow_mut().pop_front() {
        unsafe { region.free_sized(addr as *mut u8, DENSE_OBJECT) };
    }
    region.make_not_evictable();
}

#[test]
fn test_eviction_preferred_for_dense_regions() {
    logmem_test::init_test_logging();
    let tracker = logmem_alloc::worker_tracker();
    let reg = register_bytes(DENSE_OBJECT, 8);
    let region = Rc::new(Region::new());

    // Ten objects per segment leave each closed segment ~99% full, well
    // above the compaction threshold.
    let queue = fill_evictable(&region, &reg, 80);

    let stats_before = tracker.statistics();
    let used_before = tracker.region_occupancy().used_space();

    let released = tracker.reclaim(3 * SEGMENT_SIZE);
    assert!(released >= 3 * SEGMENT_SIZE, "released {}", released);

    let stats_after = tracker.statistics();
    assert!(stats_after.memory_evicted > stats_before.memory_evicted);
    assert_eq!(
        stats_after.memory_compacted, stats_before.memory_compacted,
        "dense evictable region must be evicted, not compacted"
    );

    // Free-space monotonicity: reclaim never grows used space.
    assert!(tracker.region_occupancy().used_space() <= used_before);

    drain(&region, &queue);
}

#[test]
fn test_reclaim_is_not_reentrant() {
    let tracker = logmem_alloc::worker_tracker();
    let reg = register_bytes(DENSE_OBJECT, 8);
    let region = Rc::new(Region::new());

    let inner_result: Rc<Cell<Option<usize>>> = Rc::new(Cell::new(None));
    {
        let inner_result = Rc::clone(&inner_result);
        region.make_evictable(move || {
            let tracker = logmem_alloc::worker_tracker();
            inner_result.set(Some(tracker.reclaim(1 << 20)));
            EvictionResult::Nothing
        });
    }
    let ptr = region.alloc(reg.id(), DENSE_OBJECT, 8).unwrap();

    // The outer reclaim reaches the evictor, whose nested reclaim must
    // observe the guard and report zero without recursing.
    tracker.reclaim(64 * SEGMENT_SIZE);
    assert_eq!(inner_result.get(), Some(0));

    unsafe { region.free_sized(ptr.as_ptr(), DENSE_OBJECT) };
    region.make_not_evictable();
}

#[test]
fn test_preemptible_reclaim_returns_partial_progress() {
    let tracker = logmem_alloc::worker_tracker();
    let (reg, moves) = TrackingMigrator::register(1024, 8);
    let region = Region::new();

    // A fragmented region: many segments at ~50% occupancy.
    let mut live = Vec::new();
    for index in 0..2048usize {
        let ptr = region.alloc(reg.id(), 1024, 8).unwrap();
        if index % 2 == 0 {
            live.push(ptr.as_ptr() as usize);
        } else {
            unsafe { region.free_sized(ptr.as_ptr(), 1024) };
        }
    }

    // Trip the predicate on the third poll.
    let polls = Rc::new(Cell::new(0u32));
    {
        let polls = Rc::clone(&polls);
        preempt::set_preemption_hook(move || {
            polls.set(polls.get() + 1);
            polls.get() > 2
        });
    }

    let released = tracker.reclaim_preemptibly(1 << 30);
    preempt::clear_preemption_hook();

    assert!(polls.get() > 0, "the predicate was never polled");
    assert!(released < 1 << 30, "a preempted pass cannot meet 1 GiB");

    for addr in live {
        unsafe { region.free_sized(chase(&moves, addr) as *mut u8, 1024) };
    }
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn test_compact_on_idle() {
    let tracker = logmem_alloc::worker_tracker();
    tracker
        .configure(&TrackerConfig {
            defragment_on_idle: true,
            ..TrackerConfig::default()
        })
        .unwrap();

    let (reg, moves) = TrackingMigrator::register(1024, 8);
    let region = Region::new();

    // Sparse closed segments give the idle compactor work.
    let mut live = Vec::new();
    for index in 0..3072usize {
        let ptr = region.alloc(reg.id(), 1024, 8).unwrap();
        if index % 2 == 0 {
            live.push(ptr.as_ptr() as usize);
        } else {
            unsafe { region.free_sized(ptr.as_ptr(), 1024) };
        }
    }

    let compacted_before = tracker.statistics().segments_compacted;
    let mut checks = 0;
    let result = tracker.compact_on_idle(move || {
        checks += 1;
        checks > 3
    });
    assert_eq!(result, IdleCpuResult::InterruptedByHigherPriorityTask);
    assert!(tracker.statistics().segments_compacted > compacted_before);

    for addr in live {
        unsafe { region.free_sized(chase(&moves, addr) as *mut u8, 1024) };
    }
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn test_idle_compaction_disabled_by_default() {
    let tracker = logmem_alloc::worker_tracker();
    let result = tracker.compact_on_idle(|| false);
    assert_eq!(result, IdleCpuResult::NoMoreWork);
}
