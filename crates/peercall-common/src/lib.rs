//! # peercall-common
//!
//! Shared configuration and error handling used across all peercall crates.
//! This is the foundation layer: no call logic, only primitives and contracts.

pub mod config;
pub mod error;

pub use error::{CallError, CallResult, PolicyViolation};
