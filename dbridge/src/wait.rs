//! Waitable completions: the native asynchronous-notification contract.
//!
//! Some drivers can signal completion of an in-progress call through an
//! OS-level event instead of blocking the caller, which lets the engine skip
//! the worker pool entirely. The core assumes nothing about the primitive
//! involved — only the register + notify contract expressed here:
//!
//! - [`CompletionWait::arm`] registers interest in one completion and
//!   receives a [`WaitNotifier`];
//! - the backend fires the notifier **exactly once** when the driver
//!   signals;
//! - the returned [`WaitToken`] owns backend teardown and must be dropped
//!   before the handle can be freed — the engine guarantees this by keeping
//!   the token inside the handle's Busy state.
//!
//! Platform backends (an OS event object, an eventfd, a driver callback)
//! live outside the core; the `dbridge-memory` crate ships a manually-fired
//! backend for tests.

use crate::dispatcher::Envelope;
use crate::driver::{Diagnostic, RawHandle};
use crate::types::{HandleId, OperationId};
use tokio::sync::mpsc;

/// Fires the completion notification for one armed wait.
///
/// Consuming `notify` is the only way to fire, so a backend cannot signal
/// the same wait twice. Dropping the notifier without firing strands the
/// operation — backends must fire or keep holding it.
pub struct WaitNotifier {
    tx: mpsc::UnboundedSender<Envelope>,
    handle: HandleId,
    op_id: OperationId,
}

impl WaitNotifier {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Envelope>,
        handle: HandleId,
        op_id: OperationId,
    ) -> Self {
        Self { tx, handle, op_id }
    }

    /// The operation this notifier belongs to.
    pub fn operation(&self) -> OperationId {
        self.op_id
    }

    /// Signals that the driver completed the in-progress call.
    ///
    /// The engine re-invokes the call on its consumer thread the next time
    /// it pumps. If the engine has already been torn down the notification
    /// is discarded.
    pub fn notify(self) {
        let _ = self.tx.send(Envelope::WaitFired {
            op_id: self.op_id,
            handle: self.handle,
        });
    }
}

impl std::fmt::Debug for WaitNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitNotifier")
            .field("handle", &self.handle)
            .field("op_id", &self.op_id)
            .finish_non_exhaustive()
    }
}

/// Guard for one armed wait registration.
///
/// Dropping the token runs the backend's teardown hook. The engine drops it
/// when the notification is consumed, which is therefore always before the
/// owning handle can leave the Busy state — the ordering the handle
/// lifecycle protocol requires.
pub struct WaitToken {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl WaitToken {
    /// A token whose drop runs `teardown`.
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A token with no backend state to tear down.
    pub fn noop() -> Self {
        Self { teardown: None }
    }
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl std::fmt::Debug for WaitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitToken")
            .field("armed", &self.teardown.is_some())
            .finish()
    }
}

/// A backend capable of delivering native completion notifications.
///
/// `arm` is called on the consumer thread after a driver call reported
/// still-executing. The backend must deliver exactly one notification per
/// successful registration, from any thread, by firing the notifier.
pub trait CompletionWait: Send + Sync {
    /// Registers a wait for completion of the in-progress call on `handle`.
    fn arm(&self, handle: RawHandle, notifier: WaitNotifier) -> Result<WaitToken, Diagnostic>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn token_runs_teardown_exactly_once_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = {
            let count = Arc::clone(&count);
            WaitToken::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(token);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifier_posts_a_wait_fired_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let op_id = OperationId::new();
        let notifier = WaitNotifier::new(tx, HandleId::new(3), op_id);
        assert_eq!(notifier.operation(), op_id);
        notifier.notify();

        match rx.try_recv().expect("notification queued") {
            Envelope::WaitFired {
                op_id: received,
                handle,
            } => {
                assert_eq!(received, op_id);
                assert_eq!(handle, HandleId::new(3));
            }
            Envelope::Finished { .. } => panic!("expected a wait notification"),
        }
    }
}
