//! Core identifier and lifecycle types for the `DBridge` engine.
//!
//! This module defines the fundamental types used throughout the library.
//! Identifiers use smart constructors so that, once constructed, a value is
//! always valid and no further checking is needed downstream.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a handle resource within an engine's registry.
///
/// A `HandleId` is an opaque registry index: it names a [`crate::handle`]
/// resource owned by one engine and is meaningless to any other engine.
/// Operations refer to their owning handle through this id rather than a
/// reference, so the Busy state remains the only cross-thread contract.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct HandleId(u64);

/// A globally unique operation identifier using UUIDv7 format.
///
/// `OperationId` values are guaranteed to be UUIDv7, which provides:
/// - Time-based ordering capability
/// - Globally unique identification
/// - Monotonic sort order for operations submitted in sequence
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Creates a new `OperationId` with the current timestamp.
    ///
    /// This is a convenience method that generates a new `UUIDv7`.
    pub fn new() -> Self {
        // This will always succeed as Uuid::now_v7() always returns a valid v7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

/// The kind of native driver handle a resource owns.
///
/// Kinds form a strict allocation hierarchy: an environment is allocated
/// standalone, a connection under an environment, and statements and
/// descriptors under a connection. [`HandleKind::parent_kind`] encodes that
/// hierarchy; the engine rejects allocations that violate it before touching
/// the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    /// Process-level driver environment.
    Environment,
    /// A connection to a data source.
    Connection,
    /// A statement executing under a connection.
    Statement,
    /// A descriptor attached to a connection.
    Descriptor,
}

impl HandleKind {
    /// Returns the kind of parent handle this kind must be allocated under,
    /// or `None` for kinds allocated standalone.
    pub const fn parent_kind(self) -> Option<Self> {
        match self {
            Self::Environment => None,
            Self::Connection => Some(Self::Environment),
            Self::Statement | Self::Descriptor => Some(Self::Connection),
        }
    }
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Environment => "environment",
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::Descriptor => "descriptor",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle state of a handle resource.
///
/// This is the three-valued summary exposed to callers; the in-flight phase
/// carried by the Busy state is internal to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleState {
    /// No operation in flight; the handle may start one or be freed.
    Free,
    /// Exactly one operation in flight (or parked awaiting continuation);
    /// starting another or freeing is rejected.
    Busy,
    /// The native handle has been released; terminal.
    Released,
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Busy => "busy",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// A timestamp recording when a diagnostic event occurred.
///
/// This wrapper ensures consistent timestamp handling throughout the system
/// and enables future enhancements like custom serialization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
