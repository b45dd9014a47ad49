//! Process management utilities for the extension supervisor
//!
//! This module provides the low-level pieces the supervisor builds on:
//! launching an extension with synchronous exec-failure reporting, signalling
//! it, and reaping it without blocking.
//!
//! ## Platform Support
//!
//! - **Unix**: fork/exec launcher with a close-on-exec status pipe
//!
//! ## Safety
//!
//! The launcher prepares every allocation (argument vector, environment,
//! executable path) before forking, so the child only performs
//! async-signal-safe calls between `fork` and `exec`.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
