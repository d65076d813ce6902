#![forbid(unsafe_code)]
//! Error types for TwigFS.
//!
//! # Error Taxonomy
//!
//! TwigFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Decoding | `ParseError` | `tfs-types` | Persisted byte formats (safe-link payloads, tree images) that fail to decode |
//! | Runtime | `TfsError` | `tfs-error` (this crate) | Errors returned by the store, the block layer and the body engine |
//!
//! `tfs-error` is intentionally independent of `tfs-types`; the conversion
//! from `ParseError` into `TfsError::Corruption` happens in the crate that
//! performs the decode.
//!
//! ## Store errors vs. representation errors
//!
//! The body engine distinguishes two failure classes:
//!
//! - **Store errors** (`Io`, `Corruption`, `NoSpace`, `FaultInjected`): the
//!   keyed store or block device failed. They abort the current operation but
//!   leave the file body in the state of the last committed step. See
//!   [`TfsError::is_store_error`].
//! - **`RepresentationInconsistent`**: the body engine found an item whose kind
//!   contradicts the file's declared representation, or computed an impossible
//!   length. It is never downgraded or retried.
//!
//! The internal "retry with a stronger access mode" signal is deliberately
//! absent here: it never crosses the public API.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `RepresentationInconsistent` | `EIO` |
//! | `FaultInjected` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidState` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `StaleHandle` | `ESTALE` |
//! | `StaleCoord` | `EAGAIN` |

use thiserror::Error;

/// Unified error type for all TwigFS operations.
#[derive(Debug, Error)]
pub enum TfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An item or persisted record failed validation while being decoded.
    #[error("corrupt item for object {object}: {detail}")]
    Corruption { object: u64, detail: String },

    /// An item kind contradicts the declared body representation.
    ///
    /// Fatal for the single operation that detected it.
    #[error("representation inconsistent for object {object}: {detail}")]
    RepresentationInconsistent { object: u64, detail: String },

    /// Invalid argument, geometry, or arithmetic overflow on offsets.
    #[error("invalid format: {0}")]
    Format(String),

    /// A caller asked for a state transition that is not legal from the
    /// current state (for example converting an unresolved body).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No free blocks available.
    #[error("no space left on device")]
    NoSpace,

    /// Object or record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("object exists")]
    Exists,

    /// A handle refers to an object whose deletion has completed.
    #[error("stale file handle")]
    StaleHandle,

    /// A tree coordinate outlived a structural change to its node. Walks
    /// that hit it search again from the key.
    #[error("stale tree coordinate: {0}")]
    StaleCoord(String),

    /// A failure injected by a test store to simulate interruption.
    #[error("injected fault: {0}")]
    FaultInjected(String),
}

impl TfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant without an arm is a
    /// compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. }
            | Self::RepresentationInconsistent { .. }
            | Self::FaultInjected(_) => libc::EIO,
            Self::Format(_) | Self::InvalidState(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::StaleHandle => libc::ESTALE,
            Self::StaleCoord(_) => libc::EAGAIN,
        }
    }

    /// Whether a fresh search from the same key may succeed.
    #[must_use]
    pub fn is_stale_coord(&self) -> bool {
        matches!(self, Self::StaleCoord(_))
    }

    /// Whether this error belongs to the store-error class: the operation is
    /// aborted but the body keeps the state of its last committed step.
    #[must_use]
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Corruption { .. } | Self::NoSpace | Self::FaultInjected(_)
        )
    }
}

/// Result alias using `TfsError`.
pub type Result<T> = std::result::Result<T, TfsError>;
