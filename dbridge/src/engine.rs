//! The engine: handle registry, operation submission, and the consumer-side
//! completion pump.
//!
//! An [`Engine`] is owned by one thread — the consumer thread, typically a
//! host runtime's event loop — and every lifecycle transition happens there.
//! Blocking driver calls run out of line, either on the engine's bounded
//! worker pool or, when native async notification is enabled for a handle,
//! inline under the driver's non-blocking contract with an OS-level wait
//! armed for the completion.
//!
//! The consumer thread never blocks on a driver call. [`Engine::begin`]
//! returns as soon as the operation is submitted; results arrive when the
//! embedder drains completions with [`Engine::pump`] (non-blocking) or
//! [`Engine::run_until_idle`] (blocks on the completion queue, never on the
//! driver). Completion callbacks run exactly once each, only from inside the
//! pump, and never concurrently with one another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::dispatcher::{Dispatcher, Envelope};
use crate::driver::{CallStatus, Driver, RawHandle};
use crate::errors::{EngineError, EngineResult};
use crate::handle::{HandleResource, Phase};
use crate::operation::{Continuation, ErasedOperation, VerbOperation};
use crate::registry::{self, HandleInfo};
use crate::types::{HandleId, HandleKind, HandleState, OperationId};
use crate::verb::{Outcome, Verb};
use crate::wait::{CompletionWait, WaitNotifier};

/// Engines are numbered per process, for the diagnostic registry.
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for an engine's worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing blocking driver calls.
    ///
    /// A hung call occupies one slot until it returns; it never hangs the
    /// consumer thread.
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

impl EngineConfig {
    /// Sets the worker-pool bound.
    #[must_use]
    pub const fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }
}

/// The asynchronous driver-call engine.
///
/// Generic over the [`Driver`] that allocates and releases native handles.
/// Verb logic is supplied per call through [`Engine::begin`].
///
/// # Example
///
/// ```rust,ignore
/// let mut engine = Engine::new(driver, EngineConfig::default())?;
/// let env = engine.allocate(HandleKind::Environment, None)?;
/// let conn = engine.allocate(HandleKind::Connection, Some(env))?;
///
/// engine.begin(conn, connect_verb, |outcome| match outcome {
///     Outcome::Done(()) => println!("connected"),
///     other => eprintln!("connect failed: {other:?}"),
/// })?;
///
/// engine.run_until_idle();
/// engine.free(conn)?;
/// engine.free(env)?;
/// ```
pub struct Engine<D: Driver> {
    engine_id: u64,
    driver: D,
    // Declared before `completions` so teardown joins the workers while the
    // receiving half of the queue is still alive.
    dispatcher: Dispatcher,
    completions: mpsc::UnboundedReceiver<Envelope>,
    wait_backend: Option<Arc<dyn CompletionWait>>,
    handles: HashMap<HandleId, HandleResource>,
    next_handle: u64,
    in_flight: usize,
}

impl<D: Driver> Engine<D> {
    /// Creates an engine over `driver` with the given worker-pool bound.
    pub fn new(driver: D, config: EngineConfig) -> EngineResult<Self> {
        let (dispatcher, completions) = Dispatcher::new(config.worker_threads)?;
        let engine_id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(engine_id, workers = config.worker_threads, "engine started");
        Ok(Self {
            engine_id,
            driver,
            dispatcher,
            completions,
            wait_backend: None,
            handles: HashMap::new(),
            next_handle: 1,
            in_flight: 0,
        })
    }

    /// Attaches a native completion-wait backend, enabling
    /// [`Engine::enable_native_async`] for handles whose driver supports it.
    #[must_use]
    pub fn with_wait_backend(mut self, backend: Arc<dyn CompletionWait>) -> Self {
        self.wait_backend = Some(backend);
        self
    }

    /// The engine's process-wide number, as reported to the diagnostic
    /// registry.
    pub const fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// Number of operations submitted but not yet finalized.
    ///
    /// Handles parked awaiting a continuation do not count: their operation
    /// has already delivered its callback.
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Allocates a native handle of `kind`.
    ///
    /// `parent` must match the kind's allocation hierarchy: environments are
    /// standalone, connections live under an environment, statements and
    /// descriptors under a connection.
    pub fn allocate(
        &mut self,
        kind: HandleKind,
        parent: Option<HandleId>,
    ) -> EngineResult<HandleId> {
        let parent_raw = match (kind.parent_kind(), parent) {
            (None, None) => None,
            (None, Some(given)) => {
                return Err(EngineError::Argument(format!(
                    "{kind} handles are allocated standalone, but parent {given} was supplied"
                )));
            }
            (Some(expected), None) => {
                return Err(EngineError::Argument(format!(
                    "{kind} handles require a {expected} parent"
                )));
            }
            (Some(expected), Some(given)) => {
                let parent_resource = self.handles.get(&given).ok_or_else(|| {
                    EngineError::Argument(format!("unknown parent handle {given}"))
                })?;
                if parent_resource.state() == HandleState::Released {
                    return Err(EngineError::InvalidHandle { handle: given });
                }
                if parent_resource.kind() != expected {
                    return Err(EngineError::Argument(format!(
                        "{kind} handles require a {expected} parent, but {given} is a {}",
                        parent_resource.kind()
                    )));
                }
                Some(parent_resource.raw())
            }
        };

        let raw = self.driver.allocate(kind, parent_raw)?;
        let id = HandleId::new(self.next_handle);
        self.next_handle += 1;
        let resource = HandleResource::new(id, raw, kind);
        registry::record_allocated(HandleInfo {
            engine: self.engine_id,
            handle: id,
            kind,
            state: HandleState::Free,
            created_at: resource.created_at(),
        });
        debug!(handle = %id, %kind, %raw, "handle allocated");
        self.handles.insert(id, resource);
        Ok(id)
    }

    /// Releases the native handle behind `id`.
    ///
    /// Fails with [`EngineError::Busy`] while an operation is in flight, a
    /// native wait is armed, or a continuation is pending — the conflicting
    /// operation is left untouched. After success the handle is terminally
    /// Released and every further use of `id` fails.
    pub fn free(&mut self, id: HandleId) -> EngineResult<()> {
        let resource = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| EngineError::Argument(format!("unknown handle {id}")))?;
        resource.check_release()?;

        self.driver.release(resource.kind(), resource.raw())?;
        resource.mark_released();
        registry::record_released(self.engine_id, id);
        debug!(handle = %id, "handle released");
        Ok(())
    }

    /// The lifecycle state of `id`.
    pub fn state(&self, id: HandleId) -> EngineResult<HandleState> {
        self.resource(id).map(HandleResource::state)
    }

    /// The native handle token behind `id`.
    ///
    /// For the binding layer's own driver interactions (attributes,
    /// diagnostics). The lifecycle protocol still applies: touching the
    /// native handle while an operation is in flight is the caller's
    /// contract breach to avoid.
    pub fn raw_handle(&self, id: HandleId) -> EngineResult<RawHandle> {
        let resource = self.resource(id)?;
        if resource.state() == HandleState::Released {
            return Err(EngineError::InvalidHandle { handle: id });
        }
        Ok(resource.raw())
    }

    /// Whether `id` is parked Busy-continuable, awaiting a chained
    /// operation.
    pub fn is_continuable(&self, id: HandleId) -> EngineResult<bool> {
        self.resource(id).map(HandleResource::is_continuable)
    }

    /// Enables native asynchronous notification for `id`.
    ///
    /// Requires a wait backend (see [`Engine::with_wait_backend`]), driver
    /// support for the handle's kind, and a Free handle.
    pub fn enable_native_async(&mut self, id: HandleId) -> EngineResult<()> {
        if self.wait_backend.is_none() {
            return Err(EngineError::Argument(
                "no completion-wait backend configured".into(),
            ));
        }
        let resource = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| EngineError::Argument(format!("unknown handle {id}")))?;
        match resource.state() {
            HandleState::Released => return Err(EngineError::InvalidHandle { handle: id }),
            HandleState::Busy => return Err(EngineError::Busy { handle: id }),
            HandleState::Free => {}
        }
        if !self.driver.native_async_supported(resource.kind()) {
            return Err(EngineError::Argument(format!(
                "driver does not support native async notification for {} handles",
                resource.kind()
            )));
        }
        resource.set_native_async(true);
        debug!(handle = %id, "native async notification enabled");
        Ok(())
    }

    /// Disables native asynchronous notification for `id`.
    ///
    /// Rejected while the handle is Busy: an armed wait must be consumed
    /// before the notification mode can change.
    pub fn disable_native_async(&mut self, id: HandleId) -> EngineResult<()> {
        let resource = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| EngineError::Argument(format!("unknown handle {id}")))?;
        match resource.state() {
            HandleState::Released => return Err(EngineError::InvalidHandle { handle: id }),
            HandleState::Busy => return Err(EngineError::Busy { handle: id }),
            HandleState::Free => {}
        }
        resource.set_native_async(false);
        debug!(handle = %id, "native async notification disabled");
        Ok(())
    }

    /// Begins an asynchronous operation: binds `verb` to the handle, submits
    /// it, and returns immediately.
    ///
    /// Fails synchronously with [`EngineError::Busy`] if the handle already
    /// has an operation in flight — unless that operation parked the handle
    /// in the continuable sub-state, in which case the new operation chains
    /// onto it (streamed parameter data, driver-prompted connection strings).
    ///
    /// `callback` runs exactly once, on the consumer thread, from a later
    /// [`Engine::pump`] or [`Engine::run_until_idle`] — never from inside
    /// this method.
    pub fn begin<V, F>(&mut self, id: HandleId, verb: V, callback: F) -> EngineResult<OperationId>
    where
        V: Verb,
        F: FnOnce(Outcome<V::Output>) + Send + 'static,
    {
        let wait_backend = self.wait_backend.clone();
        let sender = self.dispatcher.sender();
        let resource = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| EngineError::Argument(format!("unknown handle {id}")))?;
        resource.check_begin()?;

        let raw = resource.raw();
        let op_id = OperationId::new();
        let mut op: Box<dyn ErasedOperation> = Box::new(VerbOperation::new(verb, callback));

        if resource.native_async() && wait_backend.is_some() {
            let backend = wait_backend.expect("native path requires a backend");
            resource.begin_operation(Phase::Executing { op_id })?;
            // Under the native-async contract the driver returns without
            // blocking, so the call runs here on the consumer thread.
            let status = op.invoke(raw);
            if status == CallStatus::StillExecuting {
                let notifier = WaitNotifier::new(sender, id, op_id);
                match backend.arm(raw, notifier) {
                    Ok(token) => {
                        resource.park_waiting(op_id, op, token);
                        self.in_flight += 1;
                        debug!(handle = %id, %op_id, "operation parked on native wait");
                    }
                    Err(diag) => {
                        // The driver still owns an unfinished call we can no
                        // longer observe; all we can do is surface the
                        // registration failure to the caller synchronously.
                        error!(handle = %id, %op_id, %diag, "failed to arm native wait");
                        resource.end_operation();
                        return Err(EngineError::Driver(diag));
                    }
                }
            } else {
                // Completed inline. Deliver through the queue anyway so the
                // callback fires from the pump, never from inside begin().
                let _ = sender.send(Envelope::Finished {
                    op_id,
                    handle: id,
                    status,
                    op,
                });
                self.in_flight += 1;
                debug!(handle = %id, %op_id, ?status, "native call completed inline");
            }
        } else {
            resource.begin_operation(Phase::Executing { op_id })?;
            self.in_flight += 1;
            self.dispatcher.submit(op_id, id, raw, op);
            debug!(handle = %id, %op_id, "operation submitted to worker pool");
        }

        registry::record_state(self.engine_id, id, HandleState::Busy);
        Ok(op_id)
    }

    /// Drains every completion and wait notification queued so far, running
    /// callbacks and finalizing handles. Never blocks. Returns the number of
    /// queue entries processed.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        loop {
            match self.completions.try_recv() {
                Ok(envelope) => {
                    self.process(envelope);
                    processed += 1;
                }
                Err(_) => break,
            }
        }
        processed
    }

    /// Processes completions until no operation remains in flight.
    ///
    /// Blocks on the completion queue (never on a driver call) between
    /// completions. Handles parked awaiting a continuation do not keep this
    /// method running; the caller issues the chained operation and calls it
    /// again.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous runtime context; drive
    /// [`Engine::pump`] from such contexts instead.
    pub fn run_until_idle(&mut self) {
        while self.in_flight > 0 {
            let Some(envelope) = self.completions.blocking_recv() else {
                break;
            };
            self.process(envelope);
        }
    }

    /// Point-in-time snapshot of this engine's live (non-released) handles.
    pub fn live_handles(&self) -> Vec<HandleInfo> {
        self.handles
            .values()
            .filter(|resource| resource.state() != HandleState::Released)
            .map(|resource| HandleInfo {
                engine: self.engine_id,
                handle: resource.id(),
                kind: resource.kind(),
                state: resource.state(),
                created_at: resource.created_at(),
            })
            .collect()
    }

    fn resource(&self, id: HandleId) -> EngineResult<&HandleResource> {
        self.handles
            .get(&id)
            .ok_or_else(|| EngineError::Argument(format!("unknown handle {id}")))
    }

    fn process(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Finished {
                op_id,
                handle,
                status,
                op,
            } => self.finish(op_id, handle, status, op),
            Envelope::WaitFired { op_id, handle } => self.wait_fired(op_id, handle),
        }
    }

    /// Finalizes a completed operation: callback, then the handle's
    /// end-of-operation transition.
    fn finish(
        &mut self,
        op_id: OperationId,
        handle: HandleId,
        status: CallStatus,
        op: Box<dyn ErasedOperation>,
    ) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let Some(resource) = self.handles.get_mut(&handle) else {
            error!(%handle, %op_id, "completion for an unknown handle");
            debug_assert!(false, "completion for an unknown handle");
            return;
        };
        if resource.current_op() != Some(op_id) {
            error!(%handle, %op_id, "completion does not match the handle's in-flight operation");
            debug_assert!(
                false,
                "completion does not match the handle's in-flight operation"
            );
            return;
        }

        let raw = resource.raw();
        match op.finish(raw, status) {
            Continuation::End => {
                resource.end_operation();
                registry::record_state(self.engine_id, handle, HandleState::Free);
                debug!(handle = %handle, %op_id, ?status, "operation finalized");
            }
            Continuation::ExpectMore => {
                resource.park_continuable(op_id);
                debug!(handle = %handle, %op_id, ?status, "operation expects a continuation");
            }
        }
    }

    /// Handles a native completion notification: tears down the wait token,
    /// re-invokes the call for the final status, and either re-arms or
    /// finalizes.
    fn wait_fired(&mut self, op_id: OperationId, handle: HandleId) {
        let backend = self.wait_backend.clone();
        let sender = self.dispatcher.sender();
        let Some(resource) = self.handles.get_mut(&handle) else {
            error!(%handle, %op_id, "wait notification for an unknown handle");
            debug_assert!(false, "wait notification for an unknown handle");
            return;
        };
        let Some((mut op, token)) = resource.take_waiting(op_id) else {
            error!(%handle, %op_id, "wait notification does not match an armed wait");
            debug_assert!(false, "wait notification does not match an armed wait");
            return;
        };
        // Wait teardown strictly precedes any further handle transition.
        drop(token);

        let raw = resource.raw();
        let status = op.invoke(raw);
        if status == CallStatus::StillExecuting {
            let Some(backend) = backend else {
                // A wait was armed, so a backend existed; it cannot have
                // been removed since.
                unreachable!("wait fired without a configured backend");
            };
            let notifier = WaitNotifier::new(sender, handle, op_id);
            match backend.arm(raw, notifier) {
                Ok(token) => {
                    resource.park_waiting(op_id, op, token);
                    debug!(handle = %handle, %op_id, "still executing, wait re-armed");
                    return;
                }
                Err(diag) => {
                    error!(handle = %handle, %op_id, %diag, "failed to re-arm native wait");
                    self.in_flight = self.in_flight.saturating_sub(1);
                    op.abort(diag);
                    resource.end_operation();
                    registry::record_state(self.engine_id, handle, HandleState::Free);
                    return;
                }
            }
        }

        self.in_flight = self.in_flight.saturating_sub(1);
        match op.finish(raw, status) {
            Continuation::End => {
                resource.end_operation();
                registry::record_state(self.engine_id, handle, HandleState::Free);
                debug!(handle = %handle, %op_id, ?status, "native operation finalized");
            }
            Continuation::ExpectMore => {
                resource.park_continuable(op_id);
                debug!(handle = %handle, %op_id, ?status, "native operation expects a continuation");
            }
        }
    }
}

impl<D: Driver> Drop for Engine<D> {
    fn drop(&mut self) {
        for resource in self.handles.values_mut() {
            match resource.state() {
                HandleState::Free => {
                    if let Err(diag) = self.driver.release(resource.kind(), resource.raw()) {
                        warn!(
                            handle = %resource.id(),
                            %diag,
                            "failed to release native handle during teardown"
                        );
                    }
                    registry::record_released(self.engine_id, resource.id());
                    resource.mark_released();
                }
                HandleState::Busy => {
                    // Contract violation: a worker or an armed wait may still
                    // hold the native handle. The resource's own drop asserts
                    // in debug builds; in release the native handle is leaked
                    // rather than freed out from under the driver.
                    error!(
                        handle = %resource.id(),
                        "engine torn down while handle has an operation in progress"
                    );
                    registry::record_released(self.engine_id, resource.id());
                }
                HandleState::Released => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Diagnostic, RawHandle};
    use crate::verb;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;
    use crate::wait::WaitToken;

    /// Minimal driver: sequential handles, optional failure scripting for
    /// allocate/release.
    #[derive(Default)]
    struct TestDriver {
        next: AtomicU64,
        fail_release: Mutex<Option<Diagnostic>>,
        async_kinds: Mutex<Vec<HandleKind>>,
    }

    impl TestDriver {
        fn support_async(&self, kind: HandleKind) {
            self.async_kinds.lock().expect("lock poisoned").push(kind);
        }

        fn fail_next_release(&self, diag: Diagnostic) {
            *self.fail_release.lock().expect("lock poisoned") = Some(diag);
        }
    }

    impl Driver for TestDriver {
        fn allocate(
            &self,
            _kind: HandleKind,
            _parent: Option<RawHandle>,
        ) -> Result<RawHandle, Diagnostic> {
            Ok(RawHandle::new(self.next.fetch_add(1, Ordering::Relaxed) + 1))
        }

        fn release(&self, _kind: HandleKind, _handle: RawHandle) -> Result<(), Diagnostic> {
            match self.fail_release.lock().expect("lock poisoned").take() {
                Some(diag) => Err(diag),
                None => Ok(()),
            }
        }

        fn native_async_supported(&self, kind: HandleKind) -> bool {
            self.async_kinds
                .lock()
                .expect("lock poisoned")
                .contains(&kind)
        }
    }

    fn engine() -> Engine<Arc<TestDriver>> {
        Engine::new(Arc::new(TestDriver::default()), EngineConfig::default())
            .expect("worker pool starts")
    }

    fn statement(engine: &mut Engine<Arc<TestDriver>>) -> HandleId {
        let env = engine
            .allocate(HandleKind::Environment, None)
            .expect("environment allocates");
        let conn = engine
            .allocate(HandleKind::Connection, Some(env))
            .expect("connection allocates");
        engine
            .allocate(HandleKind::Statement, Some(conn))
            .expect("statement allocates")
    }

    fn success_verb() -> impl Verb<Output = ()> {
        verb::from_fn(
            |_| CallStatus::Success,
            |_, status| {
                if status.is_success() {
                    Outcome::Done(())
                } else {
                    Outcome::Failed(Diagnostic::new("HY000", 0, "unexpected"))
                }
            },
        )
    }

    #[test]
    fn allocation_hierarchy_is_enforced() {
        let mut engine = engine();
        let env = engine
            .allocate(HandleKind::Environment, None)
            .expect("environment allocates");

        let err = engine.allocate(HandleKind::Statement, Some(env));
        assert!(matches!(err, Err(EngineError::Argument(_))));

        let err = engine.allocate(HandleKind::Connection, None);
        assert!(matches!(err, Err(EngineError::Argument(_))));

        let err = engine.allocate(HandleKind::Environment, Some(env));
        assert!(matches!(err, Err(EngineError::Argument(_))));
    }

    #[test]
    fn successful_operation_returns_handle_to_free() {
        let mut engine = engine();
        let stmt = statement(&mut engine);
        let (tx, rx) = std_mpsc::channel();

        engine
            .begin(stmt, success_verb(), move |outcome| {
                tx.send(outcome).expect("receiver alive");
            })
            .expect("handle is free");
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Busy);

        engine.run_until_idle();
        assert_eq!(rx.try_recv().expect("callback ran"), Outcome::Done(()));
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Free);
        engine.free(stmt).expect("free handle releases");
    }

    #[test]
    fn begin_on_busy_handle_is_rejected_without_disturbing_the_operation() {
        let mut engine = engine();
        let stmt = statement(&mut engine);
        let (tx, rx) = std_mpsc::channel();

        engine
            .begin(stmt, success_verb(), move |outcome| {
                tx.send(outcome).expect("receiver alive");
            })
            .expect("handle is free");

        let second = engine.begin(stmt, success_verb(), |_| {});
        assert!(matches!(second, Err(EngineError::Busy { .. })));

        engine.run_until_idle();
        // The first operation still completed, exactly once.
        assert_eq!(rx.try_recv().expect("callback ran"), Outcome::Done(()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn free_during_execution_is_rejected_and_operation_completes() {
        let mut engine = engine();
        let stmt = statement(&mut engine);
        let (tx, rx) = std_mpsc::channel();

        engine
            .begin(
                stmt,
                verb::from_fn(
                    |_| {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        CallStatus::Success
                    },
                    |_, _| Outcome::Done(()),
                ),
                move |outcome| {
                    tx.send(outcome).expect("receiver alive");
                },
            )
            .expect("handle is free");

        assert!(matches!(
            engine.free(stmt),
            Err(EngineError::Busy { .. })
        ));
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Busy);

        engine.run_until_idle();
        assert_eq!(rx.try_recv().expect("callback ran"), Outcome::Done(()));
        engine.free(stmt).expect("free succeeds once idle");
        assert_eq!(
            engine.state(stmt).expect("known handle"),
            HandleState::Released
        );
    }

    #[test]
    fn released_handle_rejects_further_use() {
        let mut engine = engine();
        let env = engine
            .allocate(HandleKind::Environment, None)
            .expect("environment allocates");
        engine.free(env).expect("free handle releases");

        assert!(matches!(
            engine.free(env),
            Err(EngineError::InvalidHandle { .. })
        ));
        assert!(matches!(
            engine.begin(env, success_verb(), |_| {}),
            Err(EngineError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn failed_release_leaves_the_handle_usable() {
        let driver = Arc::new(TestDriver::default());
        let mut engine = Engine::new(Arc::clone(&driver), EngineConfig::default())
            .expect("worker pool starts");
        let env = engine
            .allocate(HandleKind::Environment, None)
            .expect("environment allocates");

        driver.fail_next_release(Diagnostic::new("HY000", 5, "release refused"));
        assert!(matches!(engine.free(env), Err(EngineError::Driver(_))));
        assert_eq!(engine.state(env).expect("known handle"), HandleState::Free);

        engine.free(env).expect("second attempt succeeds");
    }

    #[test]
    fn need_data_parks_the_handle_for_a_chained_operation() {
        let mut engine = engine();
        let stmt = statement(&mut engine);
        let (tx, rx) = std_mpsc::channel();

        engine
            .begin(
                stmt,
                verb::from_fn(
                    |_| CallStatus::NeedData,
                    |_, status| match status {
                        CallStatus::NeedData => Outcome::NeedData(()),
                        s if s.is_success() => Outcome::Done(()),
                        _ => Outcome::Failed(Diagnostic::new("HY000", 0, "unexpected")),
                    },
                ),
                {
                    let tx = tx.clone();
                    move |outcome| tx.send(outcome).expect("receiver alive")
                },
            )
            .expect("handle is free");
        engine.run_until_idle();

        assert_eq!(rx.try_recv().expect("callback ran"), Outcome::NeedData(()));
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Busy);
        assert!(engine.is_continuable(stmt).expect("known handle"));
        assert!(matches!(engine.free(stmt), Err(EngineError::Busy { .. })));

        // The chained operation replaces the parked one without an
        // intervening end-of-operation.
        engine
            .begin(stmt, success_verb(), move |outcome| {
                tx.send(outcome).expect("receiver alive");
            })
            .expect("continuable handle accepts a chained operation");
        engine.run_until_idle();

        assert_eq!(rx.try_recv().expect("callback ran"), Outcome::Done(()));
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Free);
        engine.free(stmt).expect("free succeeds after the chain ends");
    }

    #[test]
    fn error_outcome_returns_handle_to_free() {
        let mut engine = engine();
        let stmt = statement(&mut engine);
        let (tx, rx) = std_mpsc::channel();

        engine
            .begin(
                stmt,
                verb::from_fn(
                    |_| CallStatus::Error,
                    |_, _| -> Outcome<()> {
                        Outcome::Failed(Diagnostic::new("42000", 102, "syntax error"))
                    },
                ),
                move |outcome| tx.send(outcome).expect("receiver alive"),
            )
            .expect("handle is free");
        engine.run_until_idle();

        match rx.try_recv().expect("callback ran") {
            Outcome::Failed(diag) => {
                assert_eq!(diag.state, "42000");
                assert_eq!(diag.native, 102);
            }
            other => panic!("expected failure outcome, got {other:?}"),
        }
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Free);
    }

    #[test]
    fn enable_native_async_requires_backend_and_driver_support() {
        let driver = Arc::new(TestDriver::default());
        let mut engine = Engine::new(Arc::clone(&driver), EngineConfig::default())
            .expect("worker pool starts");
        let env = engine
            .allocate(HandleKind::Environment, None)
            .expect("environment allocates");
        let conn = engine
            .allocate(HandleKind::Connection, Some(env))
            .expect("connection allocates");

        // No backend configured.
        assert!(matches!(
            engine.enable_native_async(conn),
            Err(EngineError::Argument(_))
        ));

        struct NeverWait;
        impl CompletionWait for NeverWait {
            fn arm(
                &self,
                _handle: RawHandle,
                _notifier: WaitNotifier,
            ) -> Result<WaitToken, Diagnostic> {
                Ok(WaitToken::noop())
            }
        }

        let mut engine = engine.with_wait_backend(Arc::new(NeverWait));
        // Backend present, but the driver does not support the kind.
        assert!(matches!(
            engine.enable_native_async(conn),
            Err(EngineError::Argument(_))
        ));

        driver.support_async(HandleKind::Connection);
        engine
            .enable_native_async(conn)
            .expect("supported kind enables");
        engine
            .disable_native_async(conn)
            .expect("free handle disables");
    }

    #[test]
    fn native_path_delivers_completion_through_the_pump() {
        struct ImmediateWait;
        impl CompletionWait for ImmediateWait {
            fn arm(
                &self,
                _handle: RawHandle,
                notifier: WaitNotifier,
            ) -> Result<WaitToken, Diagnostic> {
                notifier.notify();
                Ok(WaitToken::noop())
            }
        }

        let driver = Arc::new(TestDriver::default());
        driver.support_async(HandleKind::Statement);
        let mut engine = Engine::new(Arc::clone(&driver), EngineConfig::default())
            .expect("worker pool starts")
            .with_wait_backend(Arc::new(ImmediateWait));
        let stmt = statement(&mut engine);
        engine.enable_native_async(stmt).expect("kind supported");

        let calls = Arc::new(AtomicU64::new(0));
        let (tx, rx) = std_mpsc::channel();
        let call_count = Arc::clone(&calls);
        engine
            .begin(
                stmt,
                verb::from_fn(
                    move |_| {
                        // First invocation reports still-executing; the
                        // notified re-invocation completes.
                        if call_count.fetch_add(1, Ordering::SeqCst) == 0 {
                            CallStatus::StillExecuting
                        } else {
                            CallStatus::Success
                        }
                    },
                    |_, status| {
                        if status.is_success() {
                            Outcome::Done(())
                        } else {
                            Outcome::Failed(Diagnostic::new("HY000", 0, "unexpected"))
                        }
                    },
                ),
                move |outcome| tx.send(outcome).expect("receiver alive"),
            )
            .expect("handle is free");

        // The callback never fires inside begin.
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.in_flight(), 1);

        engine.run_until_idle();
        assert_eq!(rx.try_recv().expect("callback ran"), Outcome::Done(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.state(stmt).expect("known handle"), HandleState::Free);
    }
}
