//! # logmem-alloc
//!
//! A log-structured, compacting memory allocator for per-worker caches.
//!
//! Small, frequently-mutated objects are served from fixed-size segments
//! with a bump allocator; fragmented memory is reclaimed by relocating live
//! objects into denser segments, and memory usage is bounded through
//! user-driven eviction. The main pieces:
//!
//! - **[`Region`]**: the caller-visible allocation unit; owns its segments
//!   and objects, compacts independently
//! - **[`Tracker`]**: the per-worker hub; registry of regions, low-memory
//!   entry point, reclamation scheduler
//! - **[`LsaBuffer`]**: an owning handle to a relocatable buffer that
//!   always sees the buffer's current address
//! - **[`RegionGroup`]**: aggregated usage across regions with soft/
//!   throttle thresholds and queued allocating requests
//! - **[`AllocatingSection`]**: adaptive reserve control for critical
//!   sections that allocate with reclaim locked out
//!
//! Everything is per worker thread: regions, buffers, and the tracker are
//! `!Send`, so the single-owner rule is checked at compile time.
//!
//! ## Example
//!
//! ```rust
//! use std::rc::Rc;
//! use logmem_alloc::{register_migrator, Migrator, Region};
//!
//! struct Fixed(usize);
//!
//! impl Migrator for Fixed {
//!     fn align(&self) -> usize {
//!         8
//!     }
//!     fn size(&self, _obj: *const u8) -> usize {
//!         self.0
//!     }
//!     unsafe fn migrate(&self, src: *mut u8, dst: *mut u8, size: usize) {
//!         unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
//!     }
//! }
//!
//! let registration = register_migrator(Rc::new(Fixed(8)));
//! let region = Region::new();
//! let obj = region.alloc(registration.id(), 8, 8).unwrap();
//! unsafe {
//!     obj.as_ptr().cast::<u64>().write(0xfeed);
//!     region.free(obj.as_ptr());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod background;
mod bitset;
mod log_heap;
mod sanitizer;
mod segment;
mod vle;

pub mod buffer;
pub mod group;
pub mod migrator;
pub mod occupancy;
pub mod pool;
pub mod preempt;
pub mod region;
pub mod section;
pub mod tracker;

pub use buffer::LsaBuffer;
pub use group::{GroupLimits, RegionGroup};
pub use migrator::{register_migrator, Migrator, MigratorRegistration};
pub use occupancy::OccupancyStats;
pub use pool::PoolStats;
pub use preempt::IsPreemptible;
pub use region::{EvictionResult, ReclaimLock, Region, RegionListener};
pub use section::AllocatingSection;
pub use tracker::{
    global_occupancy, memory_allocated, memory_compacted, memory_evicted, memory_freed,
    worker_tracker, IdleCpuResult, ReclaimResult, Tracker,
};

// Re-export the shared foundation types at the crate root.
pub use logmem_common::config::{BackgroundReclaimConfig, TrackerConfig};
pub use logmem_common::constants::{
    BUF_ALIGN, MAX_MANAGED_OBJECT_SIZE, SEGMENT_SIZE, SEGMENT_SIZE_SHIFT,
};
pub use logmem_common::error::{MemError, MemResult};
pub use logmem_common::types::{MigratorId, RegionId};
