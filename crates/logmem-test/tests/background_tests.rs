//! Background reclaim task behavior.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use logmem_alloc::{
    BackgroundReclaimConfig, EvictionResult, Region, TrackerConfig, SEGMENT_SIZE,
};
use logmem_test::register_bytes;

const OBJECT: usize = 13_000;

#[tokio::test(start_paused = true)]
async fn test_background_reclaim_restores_free_memory() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let tracker = logmem_alloc::worker_tracker();
            let threshold = 16 * SEGMENT_SIZE;
            tracker
                .configure(&TrackerConfig {
                    memory_budget: 128 * SEGMENT_SIZE,
                    background_reclaim: Some(BackgroundReclaimConfig {
                        free_memory_threshold: threshold,
                        poll_interval: Duration::from_millis(50),
                    }),
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

            // Fill 120 of 128 segments; free memory ends up well below the
            // background threshold.
            for _ in 0..1200 {
                let ptr = cache.alloc(reg.id(), OBJECT, 8).unwrap();
                queue.borrow_mut().push_back(ptr.as_ptr() as usize);
            }
            assert!(tracker.free_host_memory() < threshold);

            // Let the background task notice and catch up.
            tokio::time::sleep(Duration::from_millis(500)).await;

            assert!(tracker.free_host_memory() >= threshold);
            assert!(tracker.statistics().memory_evicted > 0);

            tracker.stop().await;
            while let Some(addr) = queue.borrow_mut().pop_front() {
                unsafe { cache.free_sized(addr as *mut u8, OBJECT) };
            }
            cache.make_not_evictable();
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_background_reclaim_idles_when_memory_is_healthy() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let tracker = logmem_alloc::worker_tracker();
            tracker
                .configure(&TrackerConfig {
                    memory_budget: 128 * SEGMENT_SIZE,
                    background_reclaim: Some(BackgroundReclaimConfig {
                        free_memory_threshold: 4 * SEGMENT_SIZE,
                        poll_interval: Duration::from_millis(50),
                    }),
                    ..TrackerConfig::default()
                })
                .unwrap();

            let evicted_before = tracker.statistics().memory_evicted;
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(tracker.statistics().memory_evicted, evicted_before);

            tracker.stop().await;
        })
        .await;
}
