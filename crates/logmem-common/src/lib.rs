//! # logmem-common
//!
//! Common types, errors, and configuration for logmem.
//!
//! This crate provides the foundational types shared by the allocator core
//! and its consumers:
//!
//! - **Types**: identifiers (`RegionId`, `MigratorId`) used across the
//!   allocator surface
//! - **Errors**: unified error handling with `MemError`
//! - **Config**: tracker and background-reclaim configuration
//! - **Constants**: segment geometry and policy thresholds
//!
//! ## Example
//!
//! ```rust
//! use logmem_common::types::RegionId;
//! use logmem_common::error::MemResult;
//!
//! fn example() -> MemResult<()> {
//!     let region = RegionId::new(42);
//!     assert!(region.is_valid());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::{BackgroundReclaimConfig, TrackerConfig};
pub use constants::*;
pub use error::{MemError, MemResult};
pub use types::{MigratorId, RegionId};
