//! Region-group throttling: queueing under pressure, ordered release,
//! deadlines.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use logmem_alloc::{GroupLimits, LsaBuffer, MemError, RegionGroup, SEGMENT_SIZE};

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_throttle_queues_and_releases_in_order() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // Two segments of headroom; each buffer burns a quarter
            // segment.
            let group = RegionGroup::with_limits(
                "ingest",
                GroupLimits::default().with_throttle(2 * SEGMENT_SIZE),
            );
            let region = Rc::new(group.new_region());
            let held: Rc<RefCell<Vec<LsaBuffer>>> = Rc::new(RefCell::new(Vec::new()));
            let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

            let mut handles = Vec::new();
            for index in 0..20 {
                let region = Rc::clone(&region);
                let held = Rc::clone(&held);
                let order = Rc::clone(&order);
                let group = group.clone();
                handles.push(tokio::task::spawn_local(async move {
                    group
                        .execute(
                            move || {
                                let buf = region.alloc_buf(SEGMENT_SIZE / 4).unwrap();
                                held.borrow_mut().push(buf);
                                order.borrow_mut().push(index);
                            },
                            None,
                        )
                        .await
                }));
                tokio::task::yield_now().await;
            }
            settle().await;

            // Four buffers per segment: the ninth request grants a third
            // segment and puts the group over its two-segment throttle, so
            // requests after it stay queued.
            assert!(group.under_pressure());
            assert_eq!(order.borrow().len(), 9);
            for handle in &handles[9..] {
                assert!(!handle.is_finished());
            }

            // Freeing buffers relieves the group segment by segment; the
            // queued requests run in arrival order as memory comes back.
            loop {
                settle().await;
                if handles.iter().all(|handle| handle.is_finished()) {
                    break;
                }
                let oldest = {
                    let mut held = held.borrow_mut();
                    (!held.is_empty()).then(|| held.remove(0))
                };
                drop(oldest);
            }
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
            assert_eq!(*order.borrow(), (0..20).collect::<Vec<_>>());

            held.borrow_mut().clear();
            group.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_one_release_per_relief() {
    let local = LocalSet::new();
    local
        .run_until(async {
            // Whole-segment buffers: every granted request re-crosses the
            // threshold, so exactly one queued request runs per free.
            let group = RegionGroup::with_limits(
                "ingest",
                GroupLimits::default().with_throttle(SEGMENT_SIZE),
            );
            let region = Rc::new(group.new_region());
            let held: Rc<RefCell<Vec<LsaBuffer>>> = Rc::new(RefCell::new(Vec::new()));

            let submit = |_index: usize| {
                let region = Rc::clone(&region);
                let held = Rc::clone(&held);
                let group = group.clone();
                tokio::task::spawn_local(async move {
                    group
                        .execute(
                            move || {
                                let buf = region.alloc_buf(SEGMENT_SIZE).unwrap();
                                held.borrow_mut().push(buf);
                            },
                            None,
                        )
                        .await
                })
            };

            let mut handles = Vec::new();
            for index in 0..5 {
                handles.push(submit(index));
                tokio::task::yield_now().await;
            }
            settle().await;

            // The first two ran (the second put the group over the line);
            // three are queued.
            assert!(group.under_pressure());
            let finished = |handles: &[tokio::task::JoinHandle<_>]| {
                handles.iter().filter(|handle| handle.is_finished()).count()
            };
            assert_eq!(finished(&handles), 2);

            for expected in 3..=5 {
                let buf = held.borrow_mut().remove(0);
                drop(buf);
                settle().await;
                assert_eq!(finished(&handles), expected);
            }

            for handle in handles {
                handle.await.unwrap().unwrap();
            }
            held.borrow_mut().clear();
            group.shutdown().await;
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_deadline() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let group = RegionGroup::with_limits(
                "ingest",
                GroupLimits::default().with_throttle(SEGMENT_SIZE),
            );
            let region = Rc::new(group.new_region());

            // Two whole-segment buffers put the group under pressure.
            let first = region.alloc_buf(SEGMENT_SIZE).unwrap();
            let second = region.alloc_buf(SEGMENT_SIZE).unwrap();
            assert!(group.under_pressure());

            let ran_late = Rc::new(RefCell::new(false));
            let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
            let expired = group
                .execute(
                    {
                        let ran_late = Rc::clone(&ran_late);
                        move || *ran_late.borrow_mut() = true
                    },
                    Some(deadline),
                )
                .await;
            assert!(matches!(
                expired,
                Err(MemError::BlockedRequestTimeout { .. })
            ));

            // The expired request must not run once pressure clears.
            drop(first);
            drop(second);
            settle().await;
            assert!(!*ran_late.borrow());

            group.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_nested_group_pressure_gates_children() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let parent = RegionGroup::with_limits(
                "parent",
                GroupLimits::default().with_throttle(SEGMENT_SIZE),
            );
            let child =
                RegionGroup::with_parent("child", &parent, GroupLimits::default().with_throttle(8 * SEGMENT_SIZE));
            let region = Rc::new(parent.new_region());

            let a = region.alloc_buf(SEGMENT_SIZE).unwrap();
            let b = region.alloc_buf(SEGMENT_SIZE).unwrap();
            assert!(parent.under_pressure());
            assert!(!child.under_pressure());

            // The child itself is fine, but its ancestor gates execution.
            let pending = tokio::task::spawn_local({
                let child = child.clone();
                async move { child.execute(|| 42, None).await }
            });
            settle().await;
            assert!(!pending.is_finished());

            drop(a);
            drop(b);
            settle().await;
            assert_eq!(pending.await.unwrap().unwrap(), 42);

            child.shutdown().await;
            parent.shutdown().await;
        })
        .await;
}
