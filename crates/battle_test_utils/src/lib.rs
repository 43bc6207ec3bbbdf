//! # Battle Test Utilities
//!
//! Shared testing utilities for all crates:
//! - Map and force fixtures
//! - Scripted remote player (answers, suspensions, query log)
//! - Determinism test harness
//! - Property-based testing strategies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod determinism;
pub mod fixtures;
pub mod scripted;

/// Re-export proptest for convenience.
pub use proptest;
