//! Submission paths and the completion queue.
//!
//! The dispatcher owns the bounded worker pool that executes blocking driver
//! calls and the single-consumer channel through which every completion —
//! worker-pool or native-wait — reaches the consumer thread. Having exactly
//! one queue is what gives the engine its exactly-one-notification guarantee:
//! whichever path finishes an operation posts one [`Envelope`] carrying the
//! operation itself, and only [`crate::engine::Engine::pump`] consumes them.
//!
//! The worker pool is the blocking pool of a private tokio runtime, bounded
//! by `max_blocking_threads`. A hung driver call therefore occupies one pool
//! slot without ever hanging the consumer thread. There is no cancellation:
//! once submitted, a call runs to completion.

use tokio::sync::mpsc;

use crate::driver::{CallStatus, RawHandle};
use crate::operation::ErasedOperation;
use crate::types::{HandleId, OperationId};

/// A completion crossing back to the consumer thread.
///
/// Channel transfer is the handoff point: the worker stops touching the
/// operation (and the native handle) before sending, and the channel's
/// acquire/release semantics make all of its writes visible to the consumer.
pub(crate) enum Envelope {
    /// A call finished with `status`; the operation comes back with it,
    /// ready to be finalized on the consumer thread.
    Finished {
        op_id: OperationId,
        handle: HandleId,
        status: CallStatus,
        op: Box<dyn ErasedOperation>,
    },
    /// An armed native wait was notified; the operation is still parked on
    /// its handle and the consumer must re-invoke the call.
    WaitFired {
        op_id: OperationId,
        handle: HandleId,
    },
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finished {
                op_id,
                handle,
                status,
                ..
            } => f
                .debug_struct("Finished")
                .field("op_id", op_id)
                .field("handle", handle)
                .field("status", status)
                .finish_non_exhaustive(),
            Self::WaitFired { op_id, handle } => f
                .debug_struct("WaitFired")
                .field("op_id", op_id)
                .field("handle", handle)
                .finish(),
        }
    }
}

/// Worker pool plus the sending half of the completion queue.
pub(crate) struct Dispatcher {
    runtime: tokio::runtime::Runtime,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Dispatcher {
    /// Builds a dispatcher with a blocking pool of `worker_threads` threads,
    /// returning it together with the consumer half of the completion queue.
    pub(crate) fn new(
        worker_threads: usize,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            // The async half of the runtime only shepherds blocking tasks;
            // one core thread is the minimum and all we need.
            .worker_threads(1)
            .max_blocking_threads(worker_threads.max(1))
            .thread_name("dbridge-worker")
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Self { runtime, tx }, rx))
    }

    /// A clone of the completion-queue sender, for wait notifiers.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.tx.clone()
    }

    /// Hands an operation to the worker pool and returns immediately.
    ///
    /// The worker invokes the blocking call and posts the finished envelope.
    /// If the engine is torn down before the call completes, the send fails
    /// and the completion is discarded along with the operation.
    pub(crate) fn submit(
        &self,
        op_id: OperationId,
        handle: HandleId,
        raw: RawHandle,
        mut op: Box<dyn ErasedOperation>,
    ) {
        let tx = self.tx.clone();
        // Detached on purpose: the completion envelope, not the join
        // handle, is how the result comes back.
        let _task = self.runtime.handle().spawn_blocking(move || {
            let status = op.invoke(raw);
            let _ = tx.send(Envelope::Finished {
                op_id,
                handle,
                status,
                op,
            });
        });
    }

    /// Posts an already-determined completion to the queue.
    ///
    /// Used by the native-async path so that callbacks fire from the pump
    /// even when the inline call completed immediately.
    pub(crate) fn post(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
    }
}
