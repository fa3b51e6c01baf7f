#![forbid(unsafe_code)]
//! Error types for tidepool.
//!
//! Defines `PoolError` and a `Result<T>` alias used throughout the
//! workspace, plus errno mappings for the POSIX-facing surface.

use thiserror::Error;

/// Unified error type for all tidepool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request carried a flag that forbids caching it.
    #[error("I/O flagged uncacheable")]
    Uncacheable,

    /// The request is larger than the read-ahead eligibility limit.
    #[error("read of {size} bytes exceeds read-ahead limit of {max}")]
    ReadTooLarge { size: usize, max: usize },

    /// The request spans two or more cache lines.
    #[error("read at offset {offset} of {size} bytes straddles a line boundary")]
    LineStraddle { offset: u64, size: usize },

    /// A write invalidated the line while its fill was outstanding.
    #[error("cache line at offset {offset} went stale during fill")]
    StaleLine { offset: u64 },

    /// No cache line can be allocated right now.
    #[error("no cache line available")]
    NoLineAvailable,

    /// Access past the end of the device.
    #[error("access out of bounds: offset={offset} len={len} device_len={device_len}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        device_len: u64,
    },

    /// The I/O was abandoned because its scheduler shut down.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PoolError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Uncacheable => libc::EINVAL,
            Self::ReadTooLarge { .. } => libc::EOVERFLOW,
            Self::LineStraddle { .. } => libc::EXDEV,
            Self::StaleLine { .. } => libc::ESTALE,
            Self::NoLineAvailable => libc::ENOMEM,
            Self::OutOfBounds { .. } => libc::ENXIO,
            Self::Cancelled => libc::ECANCELED,
            Self::Config(_) => libc::EINVAL,
        }
    }

    /// Whether the cache declined this I/O without touching its state,
    /// so the caller should perform its own uncached device I/O.
    #[must_use]
    pub fn is_cache_refusal(&self) -> bool {
        matches!(
            self,
            Self::Uncacheable
                | Self::ReadTooLarge { .. }
                | Self::LineStraddle { .. }
                | Self::StaleLine { .. }
                | Self::NoLineAvailable
        )
    }
}

/// Result alias using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;
