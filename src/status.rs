//! # Status Codes and Error Type
//!
//! Every fallible operation in famkv returns a [`Result`] carrying an
//! [`Error`] built from a [`StatusCode`]. The codes follow the established
//! RPC-status conventions, extended with a handful of storage-specific
//! members (`Failed`, `NotInitialized`, `NotValid`, `EndOfData`).
//!
//! ## Conventions
//!
//! - `Ok` is never materialized as an `Error`; success is `Ok(..)`.
//! - `EndOfData` is exhaustion, not failure: iterators report it when a
//!   range is drained and callers are expected to treat it as a normal
//!   loop-termination signal.
//! - `Failed` with a `needed()` hint is the recoverable buffer-too-small
//!   signal on the read path: resize the buffer to `needed()` and retry.
//! - Expected errors are returned, never logged; unusual-but-expected
//!   conditions are traced at `trace!` level by the layer that detects them.

use thiserror::Error;

/// Status code carried by every [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    /// Not an error; returned on success.
    Ok = 0,
    /// The operation was cancelled (typically by the caller).
    Cancelled = 1,
    /// Unknown error, e.g. a status from a foreign error space.
    Unknown = 2,
    /// Client specified an argument invalid regardless of system state.
    InvalidArgument = 3,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// A requested entity was not found.
    NotFound = 5,
    /// An entity we attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission for this operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted (quota, heap space).
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// Aborted, typically due to a concurrency conflict.
    Aborted = 10,
    /// Attempted past the valid range.
    OutOfRange = 11,
    /// Not implemented or not enabled.
    Unimplemented = 12,
    /// An internal invariant was broken.
    Internal = 13,
    /// Transient unavailability; retrying may succeed.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// No valid authentication credentials.
    Unauthenticated = 16,
    /// Object is not initialized and ready for use.
    NotInitialized = 17,
    /// A required object (handle, pointer) is not valid.
    NotValid = 18,
    /// Not an error: all available data has been consumed.
    EndOfData = 19,
    /// Operation failed; recoverable when a `needed()` hint is attached.
    Failed = 20,
}

/// Error carrying a [`StatusCode`], an optional human-readable detail, and
/// an optional required-length hint for the buffer-too-small path.
///
/// `Ok`-coded errors are never constructed; detail strings are omitted on
/// hot paths to keep overhead low.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?}: {}", .detail.as_deref().unwrap_or("(no detail)"))]
pub struct Error {
    code: StatusCode,
    detail: Option<String>,
    needed: Option<usize>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        debug_assert!(code != StatusCode::Ok, "Ok is not an error");
        Self {
            code,
            detail: Some(detail.into()),
            needed: None,
        }
    }

    /// Build an error with no detail string.
    pub fn bare(code: StatusCode) -> Self {
        debug_assert!(code != StatusCode::Ok, "Ok is not an error");
        Self {
            code,
            detail: None,
            needed: None,
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Required buffer length accompanying a buffer-too-small `Failed`.
    pub fn needed(&self) -> Option<usize> {
        self.needed
    }

    pub fn is_end_of_data(&self) -> bool {
        self.code == StatusCode::EndOfData
    }

    pub(crate) fn end_of_data() -> Self {
        Self::bare(StatusCode::EndOfData)
    }

    pub(crate) fn not_found() -> Self {
        Self::bare(StatusCode::NotFound)
    }

    pub(crate) fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, detail)
    }

    pub(crate) fn already_exists(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, detail)
    }

    pub(crate) fn resource_exhausted(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, detail)
    }

    pub(crate) fn permission_denied(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::PermissionDenied, detail)
    }

    pub(crate) fn not_valid(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NotValid, detail)
    }

    pub(crate) fn failed_precondition(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, detail)
    }

    /// Recoverable read-path signal: the caller's buffer holds `have`
    /// bytes but `needed` are required.
    pub(crate) fn buffer_too_small(needed: usize, have: usize) -> Self {
        Self {
            code: StatusCode::Failed,
            detail: Some(format!("value buffer too small: {have} -> {needed}")),
            needed: Some(needed),
        }
    }

    /// Wrap a low-level storage report as an internal error.
    pub(crate) fn internal(report: eyre::Report) -> Self {
        Self::new(StatusCode::Internal, format!("{report:#}"))
    }

    pub(crate) fn not_initialized(report: eyre::Report) -> Self {
        Self::new(StatusCode::NotInitialized, format!("{report:#}"))
    }
}
