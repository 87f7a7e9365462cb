//! Verb strategies: the pluggable per-call logic the engine executes.
//!
//! A [`Verb`] packages everything verb-specific about one driver call — the
//! input payload, the blocking invocation, the output payload, and the
//! interpretation of the final status code. The engine is generic over verbs:
//! it decides *where* and *when* [`Verb::call`] runs and guarantees
//! [`Verb::complete`] runs exactly once on the consumer thread; the verb
//! decides *what* the call does and what its status means.
//!
//! Two capabilities, no inheritance: a verb is any type with `call` and
//! `complete`. For one-off verbs, [`from_fn`] builds one from a pair of
//! closures.

use std::marker::PhantomData;

use crate::driver::{CallStatus, Diagnostic, RawHandle};

/// The caller-visible result of one operation, produced by
/// [`Verb::complete`] and handed to the completion callback.
///
/// The two non-terminal variants are not errors: they tell the caller the
/// driver expects a follow-up operation on the same handle, which stays Busy
/// in the continuable sub-state until the chain finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Terminal success carrying the verb's output.
    Done(T),
    /// Terminal success; the call completed but produced no data.
    NoData(T),
    /// Non-terminal: the driver needs more input data. Issue a chained
    /// operation on the same handle to supply it.
    NeedData(T),
    /// Non-terminal: partial results are available, more are pending. Issue
    /// a chained operation on the same handle to continue.
    Partial(T),
    /// Terminal failure carrying the native diagnostic.
    Failed(Diagnostic),
}

impl<T> Outcome<T> {
    /// Whether this outcome ends the operation chain.
    ///
    /// Terminal outcomes return the handle to Free; non-terminal outcomes
    /// leave it Busy awaiting a continuation.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::NoData(_) | Self::Failed(_))
    }

    /// Whether the driver asked for a follow-up operation.
    pub const fn needs_continuation(&self) -> bool {
        matches!(self, Self::NeedData(_) | Self::Partial(_))
    }

    /// The diagnostic, if this outcome is a failure.
    pub const fn error(&self) -> Option<&Diagnostic> {
        match self {
            Self::Failed(diag) => Some(diag),
            _ => None,
        }
    }

    /// The verb output, if this outcome carries one.
    pub fn into_output(self) -> Option<T> {
        match self {
            Self::Done(value) | Self::NoData(value) | Self::NeedData(value) | Self::Partial(value) => {
                Some(value)
            }
            Self::Failed(_) => None,
        }
    }
}

/// One verb's worth of driver-call logic.
///
/// # Contract
///
/// - [`Verb::call`] runs off the consumer thread on the worker-pool path, or
///   on the consumer thread when native async is enabled (where the driver
///   contract makes it non-blocking). It may be invoked more than once: on
///   the native-wait path every completion notification re-invokes it until
///   the driver stops reporting [`CallStatus::StillExecuting`].
/// - [`Verb::complete`] runs exactly once, on the consumer thread, after the
///   final status is known. It consumes the verb, so output buffers move out
///   rather than being cloned.
///
/// A verb that captures driver state (buffers, scripted responses, a
/// connection-string in progress) owns it outright; nothing is shared with
/// the engine, which is what makes the cross-thread handoff safe.
pub trait Verb: Send + 'static {
    /// Verb-specific output payload delivered through [`Outcome`].
    type Output: Send + 'static;

    /// Invokes the blocking driver call against `handle`, returning the raw
    /// status code.
    fn call(&mut self, handle: RawHandle) -> CallStatus;

    /// Interprets the final status into a caller-visible outcome.
    ///
    /// This is where verb-specific status policy lives: a data-streaming
    /// verb maps [`CallStatus::NeedData`] to [`Outcome::NeedData`], while a
    /// verb with no follow-up protocol treats the same status as a driver
    /// error.
    fn complete(self, handle: RawHandle, status: CallStatus) -> Outcome<Self::Output>;
}

/// A [`Verb`] assembled from a call closure and a completion closure.
///
/// See [`from_fn`].
pub struct FnVerb<C, K, T> {
    call: C,
    complete: K,
    _output: PhantomData<fn() -> T>,
}

impl<C, K, T> std::fmt::Debug for FnVerb<C, K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnVerb").finish_non_exhaustive()
    }
}

/// Builds a verb from two closures: the blocking call and the status
/// interpretation.
///
/// # Example
///
/// ```rust,ignore
/// let verb = verb::from_fn(
///     move |handle| driver.execute(handle, &sql),
///     move |handle, status| match status {
///         s if s.is_success() => Outcome::Done(()),
///         CallStatus::NeedData => Outcome::NeedData(()),
///         _ => Outcome::Failed(driver.last_error(handle)),
///     },
/// );
/// ```
pub fn from_fn<C, K, T>(call: C, complete: K) -> FnVerb<C, K, T>
where
    C: FnMut(RawHandle) -> CallStatus + Send + 'static,
    K: FnOnce(RawHandle, CallStatus) -> Outcome<T> + Send + 'static,
    T: Send + 'static,
{
    FnVerb {
        call,
        complete,
        _output: PhantomData,
    }
}

impl<C, K, T> Verb for FnVerb<C, K, T>
where
    C: FnMut(RawHandle) -> CallStatus + Send + 'static,
    K: FnOnce(RawHandle, CallStatus) -> Outcome<T> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn call(&mut self, handle: RawHandle) -> CallStatus {
        (self.call)(handle)
    }

    fn complete(self, handle: RawHandle, status: CallStatus) -> Outcome<T> {
        (self.complete)(handle, status)
    }
}
