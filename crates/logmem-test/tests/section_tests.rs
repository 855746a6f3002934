//! Allocating sections under real memory pressure.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use logmem_alloc::{
    AllocatingSection, EvictionResult, MemError, Region, TrackerConfig, SEGMENT_SIZE,
};
use logmem_test::register_bytes;

const OBJECT: usize = 13_000;

#[test]
fn test_section_allocates_under_reclaim_lock() {
    let reg = register_bytes(OBJECT, 8);
    let region = Region::new();
    let mut section = AllocatingSection::new();

    let ptr = section
        .run(&region, || {
            assert!(!region.reclaiming_enabled());
            region.alloc(reg.id(), OBJECT, 8)
        })
        .unwrap();
    assert!(region.reclaiming_enabled());
    unsafe { region.free_sized(ptr.as_ptr(), OBJECT) };
}

#[test]
fn test_section_reports_oom_when_exhausted() {
    let tracker = logmem_alloc::worker_tracker();
    tracker
        .configure(&TrackerConfig {
            memory_budget: 32 * SEGMENT_SIZE,
            ..TrackerConfig::default()
        })
        .unwrap();

    let reg = register_bytes(OBJECT, 8);
    let region = Region::new();

    // Fill the whole budget with live, unevictable objects.
    let mut live = Vec::new();
    loop {
        match region.alloc(reg.id(), OBJECT, 8) {
            Ok(ptr) => live.push(ptr.as_ptr()),
            Err(MemError::OutOfMemory { .. }) => break,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert!(live.len() > 200);

    let mut section = AllocatingSection::new();
    let reserve_before = section.lsa_reserve();
    let result = section.run(&region, || region.alloc(reg.id(), OBJECT, 8));
    assert!(matches!(result, Err(MemError::OutOfMemory { .. })));
    // A failed section rolls its limits back.
    assert_eq!(section.lsa_reserve(), reserve_before);

    for ptr in live {
        unsafe { region.free_sized(ptr, OBJECT) };
    }
    assert_eq!(region.occupancy().used_space(), 0);
}

#[test]
fn test_section_succeeds_by_evicting_neighbors() {
    let tracker = logmem_alloc::worker_tracker();
    tracker
        .configure(&TrackerConfig {
            memory_budget: 64 * SEGMENT_SIZE,
            ..TrackerConfig::default()
        })
        .unwrap();

    let reg = register_bytes(OBJECT, 8);
    let cache = Rc::new(Region::new());
    let queue: Rc<RefCell<VecDeque<usize>>> = Rc::new(RefCell::new(VecDeque::new()));
    {
        let queue = Rc::clone(&queue);
        let cache_handle = Rc::clone(&cache);
        cache.make_evictable(move || match queue.borrow_mut().pop_front() {
            Some(addr) => {
                unsafe { cache_handle.free_sized(addr as *mut u8, OBJECT) };
                EvictionResult::Evicted
            }
            None => EvictionResult::Nothing,
        });
    }

    // The evictable cache eats almost the whole budget: 55 of the 64
    // segments, ten objects apiece.
    for _ in 0..550 {
        let ptr = cache.alloc(reg.id(), OBJECT, 8).unwrap();
        queue.borrow_mut().push_back(ptr.as_ptr() as usize);
    }

    // A section on another region still succeeds: its reserve refill
    // evicts from the cache.
    let writer = Region::new();
    let mut section = AllocatingSection::new();
    let ptr = section
        .run(&writer, || writer.alloc(reg.id(), OBJECT, 8))
        .unwrap();
    assert!(tracker.statistics().memory_evicted > 0);

    unsafe { writer.free_sized(ptr.as_ptr(), OBJECT) };
    while let Some(addr) = queue.borrow_mut().pop_front() {
        unsafe { cache.free_sized(addr as *mut u8, OBJECT) };
    }
    cache.make_not_evictable();
}
