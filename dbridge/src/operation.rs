//! Type-erased in-flight operations.
//!
//! The engine is generic over verbs at its public surface, but internally an
//! in-flight operation must cross the worker boundary and sit in queues next
//! to operations of other verb types. [`ErasedOperation`] is that erased
//! form: it owns the verb and the completion callback outright, travels to a
//! worker (or stays on the consumer thread on the native-wait path), and is
//! consumed exactly once by whichever path finishes it.
//!
//! Ownership is the synchronization story here. While a worker holds the
//! boxed operation, the consumer thread holds only the Busy state of the
//! owning handle; when the operation comes back through the completion
//! channel, the channel's ordering guarantees make every write the worker
//! performed visible before the callback runs.

use crate::driver::{CallStatus, Diagnostic, RawHandle};
use crate::verb::{Outcome, Verb};

/// What the engine should do with the owning handle after an operation's
/// callback has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continuation {
    /// Terminal outcome: run `end_operation`, returning the handle to Free.
    End,
    /// Non-terminal outcome: park the handle Busy-continuable and await a
    /// chained operation.
    ExpectMore,
}

/// An in-flight operation with its verb type erased.
///
/// `invoke` may run on a worker thread or, on the native-wait path, on the
/// consumer thread (repeatedly, once per completion notification). `finish`
/// and `abort` consume the operation and run the completion callback; the
/// engine calls exactly one of them, exactly once, on the consumer thread.
pub(crate) trait ErasedOperation: Send {
    /// Invokes the blocking driver call.
    fn invoke(&mut self, handle: RawHandle) -> CallStatus;

    /// Interprets the final status, runs the completion callback, and
    /// reports whether the handle should expect a chained operation.
    fn finish(self: Box<Self>, handle: RawHandle, status: CallStatus) -> Continuation;

    /// Fails the operation without consulting the verb's status policy.
    ///
    /// Used when the engine itself cannot complete the operation (for
    /// example, arming a native wait failed after the call was already
    /// issued). The callback still fires exactly once.
    fn abort(self: Box<Self>, diagnostic: Diagnostic);
}

/// The one concrete [`ErasedOperation`]: a verb strategy paired with its
/// completion callback.
pub(crate) struct VerbOperation<V, F> {
    verb: Option<V>,
    callback: Option<F>,
}

impl<V, F> VerbOperation<V, F>
where
    V: Verb,
    F: FnOnce(Outcome<V::Output>) + Send + 'static,
{
    pub(crate) fn new(verb: V, callback: F) -> Self {
        Self {
            verb: Some(verb),
            callback: Some(callback),
        }
    }
}

impl<V, F> ErasedOperation for VerbOperation<V, F>
where
    V: Verb,
    F: FnOnce(Outcome<V::Output>) + Send + 'static,
{
    fn invoke(&mut self, handle: RawHandle) -> CallStatus {
        self.verb
            .as_mut()
            .expect("verb is present until finish or abort consumes the operation")
            .call(handle)
    }

    fn finish(mut self: Box<Self>, handle: RawHandle, status: CallStatus) -> Continuation {
        let verb = self
            .verb
            .take()
            .expect("verb is present until finish or abort consumes the operation");
        let callback = self
            .callback
            .take()
            .expect("callback is present until finish or abort consumes the operation");

        let outcome = verb.complete(handle, status);
        let continuation = if outcome.needs_continuation() {
            Continuation::ExpectMore
        } else {
            Continuation::End
        };
        callback(outcome);
        continuation
    }

    fn abort(mut self: Box<Self>, diagnostic: Diagnostic) {
        let callback = self
            .callback
            .take()
            .expect("callback is present until finish or abort consumes the operation");
        callback(Outcome::Failed(diagnostic));
    }
}
