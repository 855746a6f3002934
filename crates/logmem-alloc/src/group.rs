//! Region groups: memory aggregation and backpressure.
//!
//! A region group aggregates the memory footprint of its member regions
//! and subgroups, forming a rooted tree. Each group carries two
//! thresholds: crossing the soft limit raises a warning flag, crossing the
//! throttle threshold puts the group under pressure. While any ancestor is
//! under pressure, allocating requests submitted through
//! [`RegionGroup::execute`] are queued instead of run; a releaser task
//! drains the queue in arrival order whenever pressure clears. Queued
//! requests can carry a deadline and fail with a typed timeout.
//!
//! Usage flows in through the [`RegionListener`] interface: every region
//! created under a group reports its segment-granular footprint, and each
//! delta is propagated to all ancestors synchronously.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::collections::hash_map::Entry;
use std::future::Future;
use std::rc::{Rc, Weak};

use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use logmem_common::error::{MemError, MemResult};
use logmem_common::types::RegionId;

use crate::region::{Region, RegionListener};

/// Thresholds for one region group. `usize::MAX` disables a threshold.
#[derive(Debug, Clone, Copy)]
pub struct GroupLimits {
    /// Crossing this raises the group's soft-pressure flag.
    pub soft_limit: usize,
    /// Crossing this throttles allocating requests.
    pub throttle: usize,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            soft_limit: usize::MAX,
            throttle: usize::MAX,
        }
    }
}

impl GroupLimits {
    /// Sets the throttle threshold.
    #[must_use]
    pub fn with_throttle(mut self, bytes: usize) -> Self {
        self.throttle = bytes;
        self
    }

    /// Sets the soft limit.
    #[must_use]
    pub fn with_soft_limit(mut self, bytes: usize) -> Self {
        self.soft_limit = bytes;
        self
    }

    fn can_block(&self) -> bool {
        self.throttle != usize::MAX
    }
}

struct BlockedRequest {
    run: Box<dyn FnOnce()>,
    cancelled: Rc<Cell<bool>>,
}

struct GroupInner {
    name: String,
    parent: Option<Rc<GroupInner>>,
    children: RefCell<Vec<Weak<GroupInner>>>,
    soft_limit: i64,
    throttle: i64,
    total_memory: Cell<i64>,
    pressure: Cell<bool>,
    soft_pressure: Cell<bool>,
    blocked: RefCell<VecDeque<BlockedRequest>>,
    relief: Notify,
    shutdown: Cell<bool>,
    /// Footprint of this group's own regions, for largest-region lookup.
    region_usage: RefCell<HashMap<RegionId, i64>>,
    releaser: RefCell<Option<JoinHandle<()>>>,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            update(parent, -self.total_memory.get());
        }
    }
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Propagates a usage delta from `start` up to the root, toggling pressure
/// flags on every boundary crossing. The outermost group that came out of
/// pressure gets its subtree's releasers signaled.
fn update(start: &Rc<GroupInner>, delta: i64) {
    let mut top_relief: Option<Rc<GroupInner>> = None;
    let mut cursor = Some(Rc::clone(start));
    while let Some(group) = cursor {
        let total = group.total_memory.get() + delta;
        group.total_memory.set(total);

        group.soft_pressure.set(total >= group.soft_limit);

        if total > group.throttle {
            if !group.pressure.replace(true) {
                trace!("region group '{}' under pressure at {} bytes", group.name, total);
            }
        } else if group.pressure.replace(false) {
            trace!("region group '{}' relieved at {} bytes", group.name, total);
            top_relief = Some(Rc::clone(&group));
        }

        cursor = group.parent.clone();
    }
    if let Some(group) = top_relief {
        notify_relief(&group);
    }
}

fn notify_relief(group: &Rc<GroupInner>) {
    group.relief.notify_one();
    group
        .children
        .borrow_mut()
        .retain(|child| child.strong_count() > 0);
    let children: Vec<_> = group
        .children
        .borrow()
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    for child in children {
        notify_relief(&child);
    }
}

fn execution_permitted(group: &GroupInner) -> bool {
    let mut cursor = Some(group);
    while let Some(current) = cursor {
        if current.pressure.get() {
            return false;
        }
        cursor = current.parent.as_deref();
    }
    true
}

async fn releaser_loop(inner: Rc<GroupInner>) {
    debug!("region group '{}' releaser running", inner.name);
    loop {
        if inner.shutdown.get() {
            break;
        }
        let request = {
            let mut queue = inner.blocked.borrow_mut();
            if !queue.is_empty() && execution_permitted(&inner) {
                queue.pop_front()
            } else {
                None
            }
        };
        match request {
            Some(request) => {
                if !request.cancelled.get() {
                    (request.run)();
                }
                tokio::task::yield_now().await;
            }
            None => inner.relief.notified().await,
        }
    }
    // Dropping a queued request drops its result channel, failing the
    // submitter with RequestAborted.
    inner.blocked.borrow_mut().clear();
    debug!("region group '{}' releaser stopped", inner.name);
}

/// A node in the region-group tree. Handles are cheap to clone and share
/// the underlying group.
#[derive(Clone)]
pub struct RegionGroup {
    inner: Rc<GroupInner>,
}

impl RegionGroup {
    /// Creates an unthrottled root group.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None, GroupLimits::default())
    }

    /// Creates a root group with the given limits.
    ///
    /// A group with a finite throttle spawns its releaser task and must be
    /// created from within a `tokio::task::LocalSet`.
    #[must_use]
    pub fn with_limits(name: impl Into<String>, limits: GroupLimits) -> Self {
        Self::build(name.into(), None, limits)
    }

    /// Creates a subgroup of `parent`.
    #[must_use]
    pub fn with_parent(name: impl Into<String>, parent: &RegionGroup, limits: GroupLimits) -> Self {
        Self::build(name.into(), Some(Rc::clone(&parent.inner)), limits)
    }

    fn build(name: String, parent: Option<Rc<GroupInner>>, limits: GroupLimits) -> Self {
        let inner = Rc::new(GroupInner {
            name,
            parent,
            children: RefCell::new(Vec::new()),
            soft_limit: limit_to_i64(limits.soft_limit),
            throttle: limit_to_i64(limits.throttle),
            total_memory: Cell::new(0),
            pressure: Cell::new(false),
            soft_pressure: Cell::new(false),
            blocked: RefCell::new(VecDeque::new()),
            relief: Notify::new(),
            shutdown: Cell::new(false),
            region_usage: RefCell::new(HashMap::new()),
            releaser: RefCell::new(None),
        });
        if let Some(parent) = &inner.parent {
            parent.children.borrow_mut().push(Rc::downgrade(&inner));
        }
        if limits.can_block() {
            let handle = tokio::task::spawn_local(releaser_loop(Rc::clone(&inner)));
            *inner.releaser.borrow_mut() = Some(handle);
        }
        Self { inner }
    }

    /// The group's name, used in timeout and abort errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Aggregate memory of this group's regions and subgroups.
    #[must_use]
    pub fn total_memory(&self) -> usize {
        self.inner.total_memory.get().max(0) as usize
    }

    /// True while the group sits above its throttle threshold.
    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.inner.pressure.get()
    }

    /// True while the group sits at or above its soft limit.
    #[must_use]
    pub fn under_soft_pressure(&self) -> bool {
        self.inner.soft_pressure.get()
    }

    /// Creates a region whose footprint counts toward this group.
    #[must_use]
    pub fn new_region(&self) -> Region {
        Region::with_listener(Rc::new(self.clone()))
    }

    /// The region with the largest tracked footprint in this subtree.
    #[must_use]
    pub fn largest_region(&self) -> Option<RegionId> {
        fn max_region(inner: &Rc<GroupInner>) -> Option<(RegionId, i64)> {
            let mut best = inner
                .region_usage
                .borrow()
                .iter()
                .map(|(&region, &usage)| (region, usage))
                .max_by_key(|&(_, usage)| usage);
            let children: Vec<_> = inner
                .children
                .borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for child in children {
                if let Some(candidate) = max_region(&child) {
                    if best.map_or(true, |current| candidate.1 > current.1) {
                        best = Some(candidate);
                    }
                }
            }
            best
        }
        max_region(&self.inner).map(|(region, _)| region)
    }

    /// Runs an allocating request under this group's throttle.
    ///
    /// If no ancestor is under pressure and nothing is queued, `f` runs
    /// immediately. Otherwise the request is queued and run by the
    /// releaser, in arrival order, once pressure clears. A request whose
    /// deadline passes while queued completes with
    /// [`MemError::BlockedRequestTimeout`]; requests still queued at group
    /// shutdown complete with [`MemError::RequestAborted`].
    pub fn execute<T, F>(
        &self,
        f: F,
        deadline: Option<tokio::time::Instant>,
    ) -> impl Future<Output = MemResult<T>>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        enum Submission<T> {
            Immediate(T),
            Queued(oneshot::Receiver<T>, Rc<Cell<bool>>),
            Aborted,
        }

        let name = self.inner.name.clone();
        let submission = if self.inner.shutdown.get() {
            Submission::Aborted
        } else if self.inner.blocked.borrow().is_empty() && execution_permitted(&self.inner) {
            Submission::Immediate(f())
        } else {
            let (tx, rx) = oneshot::channel();
            let cancelled = Rc::new(Cell::new(false));
            self.inner.blocked.borrow_mut().push_back(BlockedRequest {
                run: Box::new(move || {
                    let _ = tx.send(f());
                }),
                cancelled: Rc::clone(&cancelled),
            });
            Submission::Queued(rx, cancelled)
        };

        async move {
            match submission {
                Submission::Immediate(value) => Ok(value),
                Submission::Aborted => Err(MemError::RequestAborted { group: name }),
                Submission::Queued(rx, cancelled) => match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(_)) => Err(MemError::RequestAborted { group: name }),
                        Err(_) => {
                            cancelled.set(true);
                            Err(MemError::BlockedRequestTimeout { group: name })
                        }
                    },
                    None => rx
                        .await
                        .map_err(|_| MemError::RequestAborted { group: name }),
                },
            }
        }
    }

    /// Stops the releaser and fails all queued requests.
    pub async fn shutdown(&self) {
        self.inner.shutdown.set(true);
        self.inner.relief.notify_one();
        let handle = self.inner.releaser.borrow_mut().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.blocked.borrow_mut().clear();
    }
}

impl RegionListener for RegionGroup {
    fn on_add(&self, region: RegionId, total_space: usize) {
        self.inner
            .region_usage
            .borrow_mut()
            .insert(region, total_space as i64);
        update(&self.inner, total_space as i64);
    }

    fn on_del(&self, region: RegionId, total_space: usize) {
        self.inner.region_usage.borrow_mut().remove(&region);
        update(&self.inner, -(total_space as i64));
    }

    fn on_usage_change(&self, region: RegionId, delta: isize) {
        match self.inner.region_usage.borrow_mut().entry(region) {
            Entry::Occupied(mut entry) => *entry.get_mut() += delta as i64,
            Entry::Vacant(entry) => {
                entry.insert(delta as i64);
            }
        }
        update(&self.inner, delta as i64);
    }

    fn on_evictable_grounded(&self, region: RegionId) {
        if let Some(usage) = self.inner.region_usage.borrow_mut().get_mut(&region) {
            *usage = 0;
        }
    }
}
