//! Integration tests for `DBridge`
//!
//! This crate contains integration tests that verify the interaction between
//! the core engine and the in-memory driver: handle lifecycle scenarios,
//! chained operations, the native-notification path, and state-machine
//! properties.

// This is a test-only crate
#![cfg(test)]
