//! Extension definition and runtime status types for the extension supervisor
//!
//! This module contains the data structures shared between the supervisor core
//! and the daemon: the declarative extension definition, the supervisor tuning
//! knobs, and the serializable status view of a supervised extension.
//!
//! ## Extension Lifecycle
//!
//! Supervised extensions move through the following statuses:
//! - `Normal`: the extension process was launched and is expected to be running
//! - `Bad`: the process exited unexpectedly and is waiting to be relaunched
//! - `Killing`: the process was asked to stop (SIGINT, then SIGKILL on timeout)
//! - `Exit`: the process is gone and the record is about to be removed

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Name of the environment variable carrying an extension's body to the child
pub const EXTENSION_BODY_ENV: &str = "MON_EXTENSION_BODY";

/// Immutable definition of one configured extension
///
/// Two definitions are equal only if all four fields match. Any difference
/// means the extension definition changed and the running process must be
/// replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionMetadata {
    /// Unique, stable identity of the extension across restarts
    pub name: String,

    /// Raw command line, tokenized at launch time
    pub command_line: String,

    /// Opaque payload handed to the child through [`EXTENSION_BODY_ENV`]
    #[serde(default)]
    pub body: String,

    /// Directory prepended to the executable named by the command line
    #[serde(default)]
    pub alternate_location: String,
}

impl ExtensionMetadata {
    /// Create a new extension definition
    pub fn new(
        name: impl Into<String>,
        command_line: impl Into<String>,
        body: impl Into<String>,
        alternate_location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
            body: body.into(),
            alternate_location: alternate_location.into(),
        }
    }
}

/// Runtime status of a supervised extension
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtensionStatus {
    /// Launched and expected to be running
    Normal,
    /// Exited unexpectedly, relaunch pending
    Bad,
    /// Stop requested, waiting for the process to exit
    Killing,
    /// Stopped and about to be removed
    Exit,
}

impl ExtensionStatus {
    /// Upper-case name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionStatus::Normal => "NORMAL",
            ExtensionStatus::Bad => "BAD",
            ExtensionStatus::Killing => "KILLING",
            ExtensionStatus::Exit => "EXIT",
        }
    }

    /// Whether a stop request should send SIGINT to the process
    pub fn accepts_interrupt(&self) -> bool {
        matches!(self, ExtensionStatus::Normal)
    }

    /// Whether the extension is on its way out
    pub fn is_stopping(&self) -> bool {
        matches!(self, ExtensionStatus::Killing | ExtensionStatus::Exit)
    }
}

impl fmt::Display for ExtensionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning knobs for the extension supervisor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSettings {
    /// Seconds an extension gets to exit after SIGINT before SIGKILL is sent.
    /// Must stay below the daemon's own shutdown grace period.
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,

    /// Maximum number of relaunches after crashes inside the crash-loop window
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds to wait before relaunching a crashed or failed extension
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,

    /// Uptime threshold in seconds. Crashes at or below it count toward the
    /// retry budget; crashes after a longer run reset the count.
    #[serde(default = "default_crash_window_secs")]
    pub crash_window_secs: u64,

    /// Extra seconds beyond the grace period to wait for a stopped extension
    #[serde(default = "default_stop_wait_slack_secs")]
    pub stop_wait_slack_secs: u64,
}

impl SupervisorSettings {
    /// Grace period between SIGINT and SIGKILL
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Delay before relaunching
    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    /// Crash-loop window
    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    /// Upper bound for waiting on the exit of one stopped extension
    pub fn stop_wait_timeout(&self) -> Duration {
        Duration::from_secs(
            self.terminate_grace_secs
                .saturating_add(self.stop_wait_slack_secs),
        )
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            terminate_grace_secs: default_terminate_grace_secs(),
            max_retries: default_max_retries(),
            retry_wait_secs: default_retry_wait_secs(),
            crash_window_secs: default_crash_window_secs(),
            stop_wait_slack_secs: default_stop_wait_slack_secs(),
        }
    }
}

const fn default_terminate_grace_secs() -> u64 {
    20
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_wait_secs() -> u64 {
    5
}

const fn default_crash_window_secs() -> u64 {
    60
}

const fn default_stop_wait_slack_secs() -> u64 {
    1
}

/// Point-in-time view of one supervised extension
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSnapshot {
    /// Extension definition the process was launched with
    pub metadata: ExtensionMetadata,
    /// Current (or last) process id
    pub pid: i32,
    /// Current status
    pub status: ExtensionStatus,
    /// Crashes counted since the last stable run
    pub retry_count: u32,
    /// Launch time of the current process (RFC3339)
    pub started_at: String,
}

impl ExtensionSnapshot {
    /// Extension name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// How a child process terminated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChildExit {
    /// Process id that exited
    pub pid: i32,

    /// Exit code (None if killed by signal)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Signal that terminated the process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Exit with a status code
    pub fn exited(pid: i32, code: i32) -> Self {
        Self {
            pid,
            exit_code: Some(code),
            signal: None,
        }
    }

    /// Exit caused by a signal
    pub fn signaled(pid: i32, signal: i32) -> Self {
        Self {
            pid,
            exit_code: None,
            signal: Some(signal),
        }
    }

    /// Check if this represents a successful exit (code 0)
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "pid {} exited with code {}", self.pid, code),
            (None, Some(sig)) => write!(f, "pid {} terminated by signal {}", self.pid, sig),
            (None, None) => write!(f, "pid {} exited", self.pid),
        }
    }
}
