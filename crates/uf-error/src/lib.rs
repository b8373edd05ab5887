#![forbid(unsafe_code)]
//! Error types for the Unfound kernel core.
//!
//! # Error Taxonomy
//!
//! | Variant | Raised by | errno | Retryable |
//! |---------|-----------|-------|-----------|
//! | `Io` | host file I/O | raw / `EIO` | no |
//! | `Device` | block storage collaborator | `EIO` | no |
//! | `ResourceExhausted` | cache miss with every slot pinned | `EAGAIN` | yes |
//! | `InvalidPath` | `add_watch` on an unresolvable path | `ENOENT` | no |
//! | `UnknownDescriptor` | remove/drain of an unregistered watch | `EINVAL` | no |
//! | `UnknownVolume` | I/O against a volume that is not attached | `ENODEV` | no |
//! | `InvalidArgument` | bad config, sizes, or masks | `EINVAL` | no |
//! | `Busy` | unmount while slots are pinned | `EBUSY` | yes |
//! | `NotFound` | namespace lookups | `ENOENT` | no |
//! | `Exists` | namespace create | `EEXIST` | no |
//! | `NotDirectory` | namespace path walk | `ENOTDIR` | no |
//! | `IsDirectory` | file op on a directory | `EISDIR` | no |
//! | `NotEmpty` | removing a populated directory | `ENOTEMPTY` | no |
//! | `BadHandle` | namespace op on a closed handle | `EBADF` | no |
//!
//! A cache miss is not an error: it is an internal lookup outcome that
//! triggers the load path. Queue overflow is not an error either: it is
//! recorded as a marker event in the affected queue.
//!
//! The core never retries internally. `is_retryable` tells the caller which
//! failures may succeed later without any change on its side.

use thiserror::Error;

/// Unified error type for all Unfound core operations.
#[derive(Debug, Error)]
pub enum UfError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block storage collaborator failed to load or store a block.
    #[error("device error on volume {volume} block {block}: {detail}")]
    Device {
        volume: u32,
        block: u64,
        detail: String,
    },

    /// No cache slot could be reclaimed for a new block.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A watched path could not be resolved.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Watch descriptor is not registered.
    #[error("unknown watch descriptor {0}")]
    UnknownDescriptor(u64),

    /// Volume is not attached to the block store.
    #[error("unknown volume {0}")]
    UnknownVolume(u32),

    /// Caller supplied an invalid argument or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource is in use.
    #[error("busy: {0}")]
    Busy(String),

    /// File or directory not found in the namespace.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists.
    #[error("file exists")]
    Exists,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Directory still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// File handle is not open.
    #[error("bad file handle {0}")]
    BadHandle(u64),
}

impl UfError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so adding a variant forces a decision here.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Device { .. } => libc::EIO,
            Self::ResourceExhausted(_) => libc::EAGAIN,
            Self::InvalidPath(_) | Self::NotFound(_) => libc::ENOENT,
            Self::UnknownDescriptor(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnknownVolume(_) => libc::ENODEV,
            Self::Busy(_) => libc::EBUSY,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::BadHandle(_) => libc::EBADF,
        }
    }

    /// Whether the same call may succeed later without caller changes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Busy(_))
    }
}

/// Result alias using `UfError`.
pub type Result<T> = std::result::Result<T, UfError>;
