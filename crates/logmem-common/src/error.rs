//! Error types for logmem.
//!
//! Recoverable failures are reported through [`MemError`]; invariant
//! violations (freeing a foreign pointer, using a deregistered migrator,
//! destroying a non-empty region) are programming bugs and abort with
//! diagnostics instead of surfacing here.

use std::fmt;
use thiserror::Error;

/// Result type alias for allocator operations.
pub type MemResult<T> = std::result::Result<T, MemError>;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and are stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Invalid configuration.
    InvalidConfig = 0x0001,

    /// Allocation cannot be satisfied even after reclaim.
    OutOfMemory = 0x0100,
    /// Buffer request exceeds the segment size.
    BufferTooLarge = 0x0101,

    /// A throttled request expired before it could run.
    BlockedRequestTimeout = 0x0200,
    /// A throttled request was dropped because its group shut down.
    RequestAborted = 0x0201,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Allocation",
            0x02 => "Throttling",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for allocator operations.
///
/// # Example
///
/// ```rust
/// use logmem_common::error::{MemError, MemResult};
///
/// fn try_alloc(bytes: usize) -> MemResult<()> {
///     Err(MemError::OutOfMemory { bytes })
/// }
/// ```
#[derive(Debug, Error)]
pub enum MemError {
    /// Allocation cannot be satisfied after retries with full compaction
    /// and eviction.
    #[error("out of memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Size of the failed request.
        bytes: usize,
    },

    /// Buffer request exceeds the maximum buffer size (one segment).
    #[error("buffer size {size} exceeds maximum {max_size}")]
    BufferTooLarge {
        /// Requested buffer size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// A request blocked on a throttled region group expired.
    #[error("blocked request timed out in region group '{group}'")]
    BlockedRequestTimeout {
        /// Name of the throttling group.
        group: String,
    },

    /// A request blocked on a region group was dropped at group shutdown.
    #[error("blocked request aborted, region group '{group}' shut down")]
    RequestAborted {
        /// Name of the group.
        group: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl MemError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Self::BufferTooLarge { .. } => ErrorCode::BufferTooLarge,
            Self::BlockedRequestTimeout { .. } => ErrorCode::BlockedRequestTimeout,
            Self::RequestAborted { .. } => ErrorCode::RequestAborted,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Returns true if the operation may succeed when retried (typically
    /// after reserves were raised or memory was freed).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::BlockedRequestTimeout { .. }
        )
    }

    /// Creates an invalid-configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
