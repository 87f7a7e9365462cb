//! `DBridge` - Asynchronous execution engine for blocking database drivers
//!
//! This library bridges a single-threaded event loop with a blocking native
//! driver API: long-running driver calls run on a bounded worker pool (or,
//! when the driver supports it, under native asynchronous notification with
//! no worker thread at all), while every completion callback runs on the one
//! consumer thread that owns the engine. A per-handle lifecycle protocol —
//! Free, Busy, Released, with at most one operation in flight — is the sole
//! cross-thread safety contract, so no native handle is ever freed or reused
//! while a call may still touch it.
//!
//! The engine is generic: a verb is any blocking function returning a status
//! code, packaged as a [`verb::Verb`] strategy, and a driver is anything
//! implementing [`driver::Driver`]. SQL semantics, parameter marshaling, and
//! host-language value conversion all live outside this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod driver;
pub mod engine;
pub mod errors;
mod handle;
pub mod registry;
pub mod types;
pub mod verb;
pub mod wait;

mod dispatcher;
mod operation;

pub use driver::{CallStatus, Diagnostic, Driver, RawHandle};
pub use engine::{Engine, EngineConfig};
pub use errors::{EngineError, EngineResult};
pub use registry::HandleInfo;
pub use types::{HandleId, HandleKind, HandleState, OperationId, Timestamp};
pub use verb::{Outcome, Verb};
pub use wait::{CompletionWait, WaitNotifier, WaitToken};
