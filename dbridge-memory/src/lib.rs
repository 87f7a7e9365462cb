//! In-memory driver for the `DBridge` engine
//!
//! This crate provides an in-memory implementation of the `Driver` trait and
//! the `CompletionWait` backend from the dbridge crate, useful for testing
//! and development scenarios where no real native driver is available.
//!
//! Behavior is scripted per handle: tests enqueue the status codes (and
//! optional simulated latency) that successive calls should return, and the
//! driver plays them back. The wait backend is fired manually, letting tests
//! drive the native-notification path deterministically.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbridge::{
    CallStatus, CompletionWait, Diagnostic, Driver, HandleKind, RawHandle, WaitNotifier, WaitToken,
};
use tracing::debug;

/// One scripted response: the status a call returns, after an optional
/// simulated execution delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedCall {
    /// Status the call reports.
    pub status: CallStatus,
    /// How long the call blocks before returning.
    pub delay: Duration,
}

impl ScriptedCall {
    /// A response returned immediately.
    pub const fn new(status: CallStatus) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
        }
    }

    /// Adds a simulated execution delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl From<CallStatus> for ScriptedCall {
    fn from(status: CallStatus) -> Self {
        Self::new(status)
    }
}

#[derive(Debug)]
struct SimHandle {
    kind: HandleKind,
    script: VecDeque<ScriptedCall>,
    last_error: Option<Diagnostic>,
}

impl SimHandle {
    fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            script: VecDeque::new(),
            last_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct DriverState {
    next_handle: u64,
    handles: HashMap<u64, SimHandle>,
    async_kinds: Vec<HandleKind>,
}

/// Thread-safe in-memory driver for testing.
///
/// Handles are simulated by sequential tokens; call behavior is scripted
/// with [`MemoryDriver::script`]. An unscripted call returns
/// [`CallStatus::Success`].
#[derive(Debug, Default)]
pub struct MemoryDriver {
    state: Mutex<DriverState>,
}

impl MemoryDriver {
    /// Creates an empty in-memory driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that handles of `kind` support native asynchronous
    /// notification.
    pub fn support_native_async(&self, kind: HandleKind) {
        let mut state = self.state.lock().expect("Mutex poisoned");
        if !state.async_kinds.contains(&kind) {
            state.async_kinds.push(kind);
        }
    }

    /// Enqueues scripted responses for calls against `handle`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not allocated; scripting a handle that does not
    /// exist is a test bug.
    pub fn script<I>(&self, handle: RawHandle, responses: I)
    where
        I: IntoIterator,
        I::Item: Into<ScriptedCall>,
    {
        let mut state = self.state.lock().expect("Mutex poisoned");
        let sim = state
            .handles
            .get_mut(&handle.value())
            .expect("scripting an unallocated handle");
        sim.script.extend(responses.into_iter().map(Into::into));
    }

    /// Sets the diagnostic reported for `handle` by
    /// [`MemoryDriver::last_error`].
    pub fn set_error(&self, handle: RawHandle, diagnostic: Diagnostic) {
        let mut state = self.state.lock().expect("Mutex poisoned");
        if let Some(sim) = state.handles.get_mut(&handle.value()) {
            sim.last_error = Some(diagnostic);
        }
    }

    /// The diagnostic for the most recent failure on `handle`.
    ///
    /// Falls back to a generic record when none was set, mirroring drivers
    /// that always have *something* in their diagnostic area.
    pub fn last_error(&self, handle: RawHandle) -> Diagnostic {
        let state = self.state.lock().expect("Mutex poisoned");
        state
            .handles
            .get(&handle.value())
            .and_then(|sim| sim.last_error.clone())
            .unwrap_or_else(|| Diagnostic::new("HY000", -1, "general error"))
    }

    /// Executes one blocking call against `handle`, playing back the next
    /// scripted response.
    ///
    /// Sleeps for the scripted delay outside the driver lock, so concurrent
    /// calls against other handles proceed unhindered — like a real driver.
    pub fn call(&self, handle: RawHandle) -> CallStatus {
        let scripted = {
            let mut state = self.state.lock().expect("Mutex poisoned");
            match state.handles.get_mut(&handle.value()) {
                Some(sim) => sim
                    .script
                    .pop_front()
                    .unwrap_or_else(|| ScriptedCall::new(CallStatus::Success)),
                None => {
                    debug!(%handle, "call against an unallocated handle");
                    return CallStatus::Error;
                }
            }
        };
        if !scripted.delay.is_zero() {
            std::thread::sleep(scripted.delay);
        }
        scripted.status
    }

    /// The kind `handle` was allocated as, if it is live.
    pub fn kind_of(&self, handle: RawHandle) -> Option<HandleKind> {
        let state = self.state.lock().expect("Mutex poisoned");
        state.handles.get(&handle.value()).map(|sim| sim.kind)
    }

    /// Number of currently allocated (not yet released) handles.
    pub fn allocated(&self) -> usize {
        self.state.lock().expect("Mutex poisoned").handles.len()
    }
}

impl Driver for MemoryDriver {
    fn allocate(
        &self,
        kind: HandleKind,
        parent: Option<RawHandle>,
    ) -> Result<RawHandle, Diagnostic> {
        let mut state = self.state.lock().expect("Mutex poisoned");
        if let Some(parent) = parent {
            if !state.handles.contains_key(&parent.value()) {
                return Err(Diagnostic::new(
                    "HY009",
                    -2,
                    format!("parent handle {parent} is not allocated"),
                ));
            }
        }
        state.next_handle += 1;
        let raw = RawHandle::new(state.next_handle);
        state.handles.insert(raw.value(), SimHandle::new(kind));
        debug!(%raw, ?kind, "simulated handle allocated");
        Ok(raw)
    }

    fn release(&self, _kind: HandleKind, handle: RawHandle) -> Result<(), Diagnostic> {
        let mut state = self.state.lock().expect("Mutex poisoned");
        match state.handles.remove(&handle.value()) {
            Some(_) => {
                debug!(%handle, "simulated handle released");
                Ok(())
            }
            None => Err(Diagnostic::new(
                "HY017",
                -3,
                format!("handle {handle} is not allocated"),
            )),
        }
    }

    fn native_async_supported(&self, kind: HandleKind) -> bool {
        self.state
            .lock()
            .expect("Mutex poisoned")
            .async_kinds
            .contains(&kind)
    }
}

/// Manually fired completion-wait backend.
///
/// Arming parks the notifier; [`MemoryWait::fire`] delivers it. Tests use
/// this to step the native-notification path deterministically.
#[derive(Debug, Default)]
pub struct MemoryWait {
    armed: Arc<Mutex<HashMap<u64, WaitNotifier>>>,
}

impl MemoryWait {
    /// Creates a backend with no armed waits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a wait is currently armed for `handle`.
    pub fn is_armed(&self, handle: RawHandle) -> bool {
        self.armed
            .lock()
            .expect("Mutex poisoned")
            .contains_key(&handle.value())
    }

    /// Fires the armed wait for `handle`, if any. Returns whether a
    /// notification was delivered.
    pub fn fire(&self, handle: RawHandle) -> bool {
        let notifier = {
            let mut armed = self.armed.lock().expect("Mutex poisoned");
            armed.remove(&handle.value())
        };
        match notifier {
            Some(notifier) => {
                debug!(%handle, "firing simulated completion notification");
                notifier.notify();
                true
            }
            None => false,
        }
    }
}

impl CompletionWait for MemoryWait {
    fn arm(&self, handle: RawHandle, notifier: WaitNotifier) -> Result<WaitToken, Diagnostic> {
        let mut armed = self.armed.lock().expect("Mutex poisoned");
        if armed.contains_key(&handle.value()) {
            return Err(Diagnostic::new(
                "HY013",
                -4,
                format!("a wait is already armed for handle {handle}"),
            ));
        }
        armed.insert(handle.value(), notifier);

        let registrations = Arc::clone(&self.armed);
        let key = handle.value();
        Ok(WaitToken::new(move || {
            // Stale registration cleanup; after a fire this is a no-op.
            registrations.lock().expect("Mutex poisoned").remove(&key);
        }))
    }
}
