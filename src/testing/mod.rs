//! Testing utilities and mock implementations
//!
//! Provides an in-memory transport plus scripted handlers and sinks so the
//! pipeline can be exercised end to end without a broker.

pub mod mocks;

pub use mocks::*;
