//! Schema definitions for the extension supervisor
//!
//! This crate contains the data structures shared between the supervisor core
//! and the daemon. All types here implement JSON Schema generation for external
//! consumption.

use std::time::SystemTime;

pub mod extension;


pub use extension::*;

/// Grace period, in seconds, the service manager gives the whole daemon to exit.
/// Extension grace periods must stay below it.
pub const DAEMON_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Create a timestamp string in RFC3339 format
#[must_use]
pub fn format_timestamp(time: SystemTime) -> String {
    humantime::format_rfc3339_seconds(time).to_string()
}

/// Create a current timestamp string in RFC3339 format
#[must_use]
pub fn current_timestamp() -> String {
    format_timestamp(SystemTime::now())
}
