//! Error types for the `DBridge` engine.
//!
//! The error design follows these principles:
//!
//! - **Rich error information**: Include context to help diagnose issues
//! - **Synchronous vs. asynchronous separation**: argument and concurrency
//!   failures reject the call that made them, while driver failures during an
//!   operation surface only through the completion callback's
//!   [`crate::verb::Outcome::Failed`]
//! - **Actionable**: Callers can determine how to handle each variant
//!
//! # Error Categories
//!
//! - [`EngineError::Argument`] — malformed caller input, detected before any
//!   operation exists; never touches a handle
//! - [`EngineError::Busy`] — an action conflicted with an in-flight operation
//!   or an armed native wait; always synchronous, always leaves the existing
//!   operation untouched
//! - [`EngineError::InvalidHandle`] — use of a handle after release
//! - [`EngineError::Driver`] — a native call failed synchronously (handle
//!   allocation or release); carries the native diagnostic
//! - [`EngineError::Io`] — the worker pool could not be constructed
//!
//! Programming-contract breaches (destroying a Busy handle, a completion for
//! an operation the engine does not know) are not represented here: they are
//! unrecoverable and terminate via `debug_assert!` in debug builds, with a
//! `tracing::error!` record in release builds.

use thiserror::Error;

use crate::driver::Diagnostic;
use crate::types::HandleId;

/// Errors returned synchronously by engine entry points.
///
/// # Error Handling Strategy
///
/// - **Argument**: fix the call site; nothing was submitted
/// - **Busy**: await the completion callback of the in-flight operation,
///   then retry; the engine never queues implicitly
/// - **InvalidHandle**: the handle was freed; allocate a new one
/// - **Driver**: inspect the diagnostic; the handle is unchanged unless the
///   failed call was an allocation (in which case no handle exists)
/// - **Io**: the engine could not start its worker pool; nothing is running
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed caller input, rejected before any operation was created.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The handle has an operation in flight or a native wait armed.
    #[error("handle {handle} is busy: an operation is in progress")]
    Busy {
        /// The handle the conflicting action targeted.
        handle: HandleId,
    },

    /// The handle was released and can no longer be used.
    #[error("handle {handle} has been released")]
    InvalidHandle {
        /// The released handle.
        handle: HandleId,
    },

    /// A native driver call failed synchronously.
    #[error("driver error: {0}")]
    Driver(#[from] Diagnostic),

    /// The worker pool could not be constructed.
    #[error("worker pool unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for engine operation results.
pub type EngineResult<T> = Result<T, EngineError>;
