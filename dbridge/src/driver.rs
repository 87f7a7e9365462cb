//! The driver seam: the contract between the engine and a native
//! database-connectivity layer.
//!
//! The engine never interprets a native handle and never decides what a
//! status code means for a particular verb. Everything driver-specific sits
//! behind two small surfaces:
//!
//! - [`Driver`] — allocates and releases native handles and reports whether
//!   native asynchronous notification is available for a handle kind.
//! - [`CallStatus`] — the closed set of status codes a blocking driver call
//!   can return, mirrored from the native layer's return codes.
//!
//! Per-verb call logic lives behind [`crate::verb::Verb`] strategies, which
//! receive the [`RawHandle`] token and talk to the driver themselves.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::types::HandleKind;

/// An opaque token naming a native driver handle.
///
/// The engine treats this as a pure value: it is handed to the driver and to
/// verb strategies, which alone know how to interpret it. The engine's
/// lifecycle protocol (one in-flight operation per handle, release only when
/// free) is what makes passing the token across threads safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawHandle(u64);

impl RawHandle {
    /// Wraps a native handle value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying native handle value.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Status code returned by a blocking driver call.
///
/// This is the complete vocabulary the engine understands. What each code
/// means for a given verb is the verb's business (for example, `NeedData` is
/// a normal part of streaming parameter data but an error for a plain
/// execute); the engine only cares about `StillExecuting`, which routes an
/// operation onto the native-wait path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    /// The call completed successfully.
    Success,
    /// The call completed successfully with informational diagnostics.
    SuccessWithInfo,
    /// The driver needs more input data before the call can complete.
    NeedData,
    /// The call completed but produced no data.
    NoData,
    /// The call is still executing; a native completion notification will
    /// follow. Only returned when native async is enabled for the handle.
    StillExecuting,
    /// Partial results are available; more are pending.
    PartialData,
    /// The call failed; diagnostics are available from the driver.
    Error,
}

impl CallStatus {
    /// Whether the status is success-class (`Success` or `SuccessWithInfo`).
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SuccessWithInfo)
    }
}

/// A native diagnostic record carried by driver-level failures.
///
/// `state` holds the driver's five-character condition code, `native` the
/// driver-specific numeric code, and `message` the human-readable text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{state}] {message} (native code {native})")]
pub struct Diagnostic {
    /// Five-character condition code reported by the driver.
    pub state: String,
    /// Driver-specific numeric error code.
    pub native: i32,
    /// Human-readable diagnostic message.
    pub message: String,
}

impl Diagnostic {
    /// Creates a diagnostic record.
    pub fn new(state: impl Into<String>, native: i32, message: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            native,
            message: message.into(),
        }
    }

    /// Diagnostic for a status the engine did not expect on the path it
    /// arrived on, such as `StillExecuting` from a blocking call.
    pub fn unexpected_status(status: CallStatus) -> Self {
        Self::new(
            "HY010",
            0,
            format!("driver returned unexpected status {status:?}"),
        )
    }
}

/// The native driver contract consulted by the engine for handle lifecycle.
///
/// Implementations wrap a real connectivity layer or, in tests, simulate one
/// (see the `dbridge-memory` crate). All methods are blocking but expected to
/// be brief: allocation and release of handles are local bookkeeping calls in
/// every driver this engine targets, so they run on the consumer thread. The
/// long-running work happens in verb strategies, which the engine dispatches
/// off-thread.
pub trait Driver {
    /// Allocates a native handle of `kind`, optionally under `parent`.
    ///
    /// The engine validates the parent's kind and lifecycle state before
    /// calling this, so implementations may assume a well-formed request.
    fn allocate(&self, kind: HandleKind, parent: Option<RawHandle>)
        -> Result<RawHandle, Diagnostic>;

    /// Releases a native handle previously returned by [`Driver::allocate`].
    ///
    /// The engine guarantees no operation is in flight and no wait is armed
    /// on the handle when this is called.
    fn release(&self, kind: HandleKind, handle: RawHandle) -> Result<(), Diagnostic>;

    /// Whether the driver can deliver native asynchronous completion
    /// notifications for handles of `kind`.
    fn native_async_supported(&self, kind: HandleKind) -> bool {
        let _ = kind;
        false
    }
}

impl<D: Driver + ?Sized> Driver for Arc<D> {
    fn allocate(
        &self,
        kind: HandleKind,
        parent: Option<RawHandle>,
    ) -> Result<RawHandle, Diagnostic> {
        (**self).allocate(kind, parent)
    }

    fn release(&self, kind: HandleKind, handle: RawHandle) -> Result<(), Diagnostic> {
        (**self).release(kind, handle)
    }

    fn native_async_supported(&self, kind: HandleKind) -> bool {
        (**self).native_async_supported(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_classification_matches_driver_convention() {
        assert!(CallStatus::Success.is_success());
        assert!(CallStatus::SuccessWithInfo.is_success());
        assert!(!CallStatus::NeedData.is_success());
        assert!(!CallStatus::NoData.is_success());
        assert!(!CallStatus::StillExecuting.is_success());
        assert!(!CallStatus::PartialData.is_success());
        assert!(!CallStatus::Error.is_success());
    }

    #[test]
    fn diagnostic_display_includes_state_and_code() {
        let diag = Diagnostic::new("08001", 17, "unable to connect");
        let text = diag.to_string();
        assert!(text.contains("08001"));
        assert!(text.contains("17"));
        assert!(text.contains("unable to connect"));
    }

    #[test]
    fn raw_handle_formats_as_hex() {
        assert_eq!(RawHandle::new(0x2a).to_string(), "0x2a");
    }

    #[test]
    fn statuses_and_diagnostics_round_trip_through_json() {
        let status = serde_json::to_string(&CallStatus::NeedData).expect("status serializes");
        assert_eq!(status, "\"NeedData\"");

        let diag = Diagnostic::new("08S01", 10054, "communication link failure");
        let json = serde_json::to_string(&diag).expect("diagnostic serializes");
        let parsed: Diagnostic = serde_json::from_str(&json).expect("diagnostic deserializes");
        assert_eq!(parsed, diag);
    }
}
