//! Handle resources and their lifecycle protocol.
//!
//! A [`HandleResource`] owns one native driver handle and enforces the
//! exclusive-access rules that make cross-thread execution safe:
//!
//! - at most one operation is in flight per handle, structurally — the Busy
//!   state *is* the in-flight phase;
//! - the native handle is released only from the Free state;
//! - a handle is never destroyed while Busy — that is a programming-contract
//!   violation, asserted in debug builds, because a worker thread or an
//!   armed native wait may still hold the native handle.
//!
//! Every transition happens on the consumer thread. That single-threaded
//! discipline, not a lock, is the synchronization primitive: the worker only
//! ever sees the raw handle token and the verb it owns, never this state.

use tracing::error;

use crate::driver::RawHandle;
use crate::errors::{EngineError, EngineResult};
use crate::operation::ErasedOperation;
use crate::types::{HandleId, HandleKind, HandleState, OperationId, Timestamp};
use crate::wait::WaitToken;

/// The in-flight phase carried by the Busy state.
pub(crate) enum Phase {
    /// The operation is with the worker pool (or queued for it); the boxed
    /// operation itself is travelling and will come back in its completion
    /// envelope.
    Executing { op_id: OperationId },
    /// A native wait is armed; the operation is parked here together with
    /// the wait token, which must be torn down before anything else happens
    /// to this handle.
    Waiting {
        op_id: OperationId,
        op: Box<dyn ErasedOperation>,
        token: WaitToken,
    },
    /// The previous operation ended in a "more data expected" outcome; the
    /// handle stays Busy awaiting a chained operation.
    Continuable { op_id: OperationId },
}

impl Phase {
    pub(crate) fn op_id(&self) -> OperationId {
        match self {
            Self::Executing { op_id }
            | Self::Waiting { op_id, .. }
            | Self::Continuable { op_id } => *op_id,
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing { op_id } => write!(f, "Executing({op_id})"),
            Self::Waiting { op_id, .. } => write!(f, "Waiting({op_id})"),
            Self::Continuable { op_id } => write!(f, "Continuable({op_id})"),
        }
    }
}

/// Internal lifecycle: the three observable states, with Busy carrying its
/// in-flight phase.
#[derive(Debug)]
enum Lifecycle {
    Free,
    Busy(Phase),
    Released,
}

/// One native driver handle and its lifecycle state.
pub(crate) struct HandleResource {
    id: HandleId,
    raw: RawHandle,
    kind: HandleKind,
    lifecycle: Lifecycle,
    native_async: bool,
    created_at: Timestamp,
}

impl HandleResource {
    pub(crate) fn new(id: HandleId, raw: RawHandle, kind: HandleKind) -> Self {
        Self {
            id,
            raw,
            kind,
            lifecycle: Lifecycle::Free,
            native_async: false,
            created_at: Timestamp::now(),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.raw
    }

    pub(crate) fn kind(&self) -> HandleKind {
        self.kind
    }

    pub(crate) fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub(crate) fn state(&self) -> HandleState {
        match self.lifecycle {
            Lifecycle::Free => HandleState::Free,
            Lifecycle::Busy(_) => HandleState::Busy,
            Lifecycle::Released => HandleState::Released,
        }
    }

    pub(crate) fn native_async(&self) -> bool {
        self.native_async
    }

    pub(crate) fn set_native_async(&mut self, enabled: bool) {
        self.native_async = enabled;
    }

    pub(crate) fn is_continuable(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Busy(Phase::Continuable { .. }))
    }

    /// Checks that a new operation may begin, without transitioning.
    ///
    /// Allowed from Free and from the Busy-continuable sub-state (chained
    /// operations); rejected from any other Busy phase and after release.
    pub(crate) fn check_begin(&self) -> EngineResult<()> {
        match &self.lifecycle {
            Lifecycle::Free | Lifecycle::Busy(Phase::Continuable { .. }) => Ok(()),
            Lifecycle::Busy(_) => Err(EngineError::Busy { handle: self.id }),
            Lifecycle::Released => Err(EngineError::InvalidHandle { handle: self.id }),
        }
    }

    /// Free → Busy (or Continuable → Busy for a chained operation),
    /// recording the new in-flight phase.
    pub(crate) fn begin_operation(&mut self, phase: Phase) -> EngineResult<()> {
        self.check_begin()?;
        self.lifecycle = Lifecycle::Busy(phase);
        Ok(())
    }

    /// Busy → Free, after the operation's result has been consumed.
    ///
    /// Runs exactly once per logical operation; calling it in any other
    /// state is a contract breach inside the engine itself.
    pub(crate) fn end_operation(&mut self) {
        debug_assert!(
            matches!(self.lifecycle, Lifecycle::Busy(_)),
            "end_operation on a handle that is not busy"
        );
        self.lifecycle = Lifecycle::Free;
    }

    /// Parks the operation and its armed wait token on the handle.
    ///
    /// Used on the native-async path when the driver reported
    /// still-executing; the operation waits here, consumer-owned, until the
    /// backend fires the notification.
    pub(crate) fn park_waiting(
        &mut self,
        op_id: OperationId,
        op: Box<dyn ErasedOperation>,
        token: WaitToken,
    ) {
        debug_assert!(
            matches!(self.lifecycle, Lifecycle::Busy(_)),
            "park_waiting on a handle that is not busy"
        );
        self.lifecycle = Lifecycle::Busy(Phase::Waiting { op_id, op, token });
    }

    /// Parks the handle Busy-continuable after a "more data expected"
    /// outcome.
    pub(crate) fn park_continuable(&mut self, op_id: OperationId) {
        debug_assert!(
            matches!(self.lifecycle, Lifecycle::Busy(_)),
            "park_continuable on a handle that is not busy"
        );
        self.lifecycle = Lifecycle::Busy(Phase::Continuable { op_id });
    }

    /// The in-flight operation id, if any.
    pub(crate) fn current_op(&self) -> Option<OperationId> {
        match &self.lifecycle {
            Lifecycle::Busy(phase) => Some(phase.op_id()),
            Lifecycle::Free | Lifecycle::Released => None,
        }
    }

    /// Takes the parked operation and wait token for a fired wait,
    /// leaving the handle Busy-executing while the call is re-invoked.
    ///
    /// Returns `None` if the handle is not in the waiting phase for
    /// `op_id` — a stale notification, which the engine treats as a
    /// contract breach by the wait backend.
    pub(crate) fn take_waiting(
        &mut self,
        op_id: OperationId,
    ) -> Option<(Box<dyn ErasedOperation>, WaitToken)> {
        let is_parked = matches!(
            &self.lifecycle,
            Lifecycle::Busy(Phase::Waiting { op_id: parked, .. }) if *parked == op_id
        );
        if !is_parked {
            return None;
        }
        let previous =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Busy(Phase::Executing { op_id }));
        match previous {
            Lifecycle::Busy(Phase::Waiting { op, token, .. }) => Some((op, token)),
            _ => unreachable!("lifecycle checked immediately above"),
        }
    }

    /// Checks that the native handle may be released: never while Busy (an
    /// operation in flight, a wait armed, or a continuation pending), never
    /// twice.
    pub(crate) fn check_release(&self) -> EngineResult<()> {
        match &self.lifecycle {
            Lifecycle::Free => Ok(()),
            Lifecycle::Busy(_) => Err(EngineError::Busy { handle: self.id }),
            Lifecycle::Released => Err(EngineError::InvalidHandle { handle: self.id }),
        }
    }

    /// Free → Released. Terminal; the caller has already released the
    /// native handle through the driver.
    pub(crate) fn mark_released(&mut self) {
        debug_assert!(
            matches!(self.lifecycle, Lifecycle::Free),
            "mark_released on a handle that is not free"
        );
        self.lifecycle = Lifecycle::Released;
    }
}

impl Drop for HandleResource {
    fn drop(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Busy(_)) {
            error!(
                handle = %self.id,
                kind = %self.kind,
                "handle destroyed while an operation is in progress"
            );
            debug_assert!(
                !matches!(self.lifecycle, Lifecycle::Busy(_)),
                "handle destroyed while an operation is in progress"
            );
        }
    }
}

impl std::fmt::Debug for HandleResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleResource")
            .field("id", &self.id)
            .field("raw", &self.raw)
            .field("kind", &self.kind)
            .field("lifecycle", &self.lifecycle)
            .field("native_async", &self.native_async)
            .finish_non_exhaustive()
    }
}
