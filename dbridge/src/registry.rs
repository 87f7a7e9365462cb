//! Optional process-wide registry of live handles, for diagnostics.
//!
//! Disabled by default: recording is a no-op until [`init`] is called, and
//! stops again after [`shutdown`]. When enabled, every engine in the process
//! reports handle allocations and releases here, and [`snapshot`] returns
//! the live set — useful for finding leaked handles in long-running hosts.
//!
//! This is diagnostic state only. The engine's correctness never depends on
//! it, and it is the one piece of the crate touched from a lock rather than
//! the consumer thread, since engines on different threads may share the
//! process.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{HandleId, HandleKind, HandleState, Timestamp};

/// A point-in-time description of one live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    /// The engine the handle belongs to (engines are numbered per process).
    pub engine: u64,
    /// The handle's registry id within its engine.
    pub handle: HandleId,
    /// The kind of native handle.
    pub kind: HandleKind,
    /// Lifecycle state at snapshot time.
    pub state: HandleState,
    /// When the handle was allocated.
    pub created_at: Timestamp,
}

static LIVE: Mutex<Option<HashMap<(u64, HandleId), HandleInfo>>> = Mutex::new(None);

/// Starts recording handle allocations process-wide.
///
/// Idempotent; an already-initialized registry keeps its contents.
pub fn init() {
    let mut live = LIVE.lock();
    if live.is_none() {
        *live = Some(HashMap::new());
    }
}

/// Stops recording and discards the live set.
pub fn shutdown() {
    *LIVE.lock() = None;
}

/// Whether the registry is currently recording.
pub fn is_enabled() -> bool {
    LIVE.lock().is_some()
}

/// The current live set, in no particular order.
///
/// Empty when the registry is not recording.
pub fn snapshot() -> Vec<HandleInfo> {
    LIVE.lock()
        .as_ref()
        .map(|live| live.values().cloned().collect())
        .unwrap_or_default()
}

pub(crate) fn record_allocated(info: HandleInfo) {
    if let Some(live) = LIVE.lock().as_mut() {
        live.insert((info.engine, info.handle), info);
    }
}

pub(crate) fn record_state(engine: u64, handle: HandleId, state: HandleState) {
    if let Some(live) = LIVE.lock().as_mut() {
        if let Some(info) = live.get_mut(&(engine, handle)) {
            info.state = state;
        }
    }
}

pub(crate) fn record_released(engine: u64, handle: HandleId) {
    if let Some(live) = LIVE.lock().as_mut() {
        live.remove(&(engine, handle));
    }
}
