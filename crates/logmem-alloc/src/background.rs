//! Background reclaim task.
//!
//! A cooperative task that watches free host memory and reclaims
//! preemptibly when it drops below the configured threshold, so that
//! foreground allocations rarely have to reclaim synchronously. The task
//! is spawned onto the worker's local task set and yields between passes;
//! when a pass makes no progress it backs off for one poll interval
//! instead of spinning.

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use logmem_common::config::BackgroundReclaimConfig;

use crate::tracker::Tracker;

pub(crate) struct BackgroundReclaimer {
    shutdown: Rc<Cell<bool>>,
    wake: Rc<Notify>,
    handle: JoinHandle<()>,
}

impl BackgroundReclaimer {
    /// Spawns the reclaim loop. Must be called from within a
    /// `tokio::task::LocalSet`.
    pub(crate) fn spawn(tracker: Rc<Tracker>, config: BackgroundReclaimConfig) -> Self {
        let shutdown = Rc::new(Cell::new(false));
        let wake = Rc::new(Notify::new());
        let handle = tokio::task::spawn_local(main_loop(
            tracker,
            config,
            Rc::clone(&shutdown),
            Rc::clone(&wake),
        ));
        Self {
            shutdown,
            wake,
            handle,
        }
    }

    pub(crate) async fn stop(self) {
        self.shutdown.set(true);
        self.wake.notify_one();
        let _ = self.handle.await;
    }
}

async fn main_loop(
    tracker: Rc<Tracker>,
    config: BackgroundReclaimConfig,
    shutdown: Rc<Cell<bool>>,
    wake: Rc<Notify>,
) {
    debug!("background reclaim: entry");
    loop {
        if shutdown.get() {
            break;
        }
        let free = tracker.free_host_memory();
        if free < config.free_memory_threshold {
            let target = config.free_memory_threshold - free;
            trace!("background reclaim: {} bytes behind", target);
            let released = tracker.reclaim_preemptibly(target);
            tokio::task::yield_now().await;
            if released > 0 {
                continue;
            }
            // Nothing to reclaim right now; don't spin on the deficit.
        }
        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
    debug!("background reclaim: exit");
}
