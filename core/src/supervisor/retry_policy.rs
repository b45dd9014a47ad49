//! Crash-loop retry decisions and failed-spawn tracking
//!
//! A crash counts toward the retry budget only when the process ran for at
//! most the crash-loop window; a longer run resets the count. Extensions that
//! could not be launched at all are tracked separately so the next request
//! for them waits out the retry delay first.

use schema::SupervisorSettings;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Action to take when an extension crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Relaunch the extension after `delay`
    Relaunch { delay: Duration, retry_count: u32 },
    /// Retry budget exhausted, remove the extension
    GiveUp { retry_count: u32 },
}

impl RetryDecision {
    /// Retry count to store on the record
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryDecision::Relaunch { retry_count, .. } | RetryDecision::GiveUp { retry_count } => {
                *retry_count
            }
        }
    }
}

/// Retry policy engine for crashed extensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashLoopPolicy {
    max_retries: u32,
    retry_wait: Duration,
    crash_window: Duration,
}

impl CrashLoopPolicy {
    /// Create a policy from explicit limits
    pub fn new(max_retries: u32, retry_wait: Duration, crash_window: Duration) -> Self {
        Self {
            max_retries,
            retry_wait,
            crash_window,
        }
    }

    /// Create a policy from supervisor settings
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self::new(
            settings.max_retries,
            settings.retry_wait(),
            settings.crash_window(),
        )
    }

    /// Delay before any relaunch
    pub fn retry_wait(&self) -> Duration {
        self.retry_wait
    }

    /// Retry count after a crash following `uptime`
    pub fn next_retry_count(&self, current: u32, uptime: Duration) -> u32 {
        if uptime <= self.crash_window {
            current.saturating_add(1)
        } else {
            0
        }
    }

    /// Decide what to do after a crash
    pub fn on_crash(&self, current: u32, uptime: Duration) -> RetryDecision {
        let retry_count = self.next_retry_count(current, uptime);
        debug!(
            "Crash after {:?} uptime: retry count {} -> {} (max {})",
            uptime, current, retry_count, self.max_retries
        );
        if retry_count <= self.max_retries {
            RetryDecision::Relaunch {
                delay: self.retry_wait,
                retry_count,
            }
        } else {
            RetryDecision::GiveUp { retry_count }
        }
    }
}

impl Default for CrashLoopPolicy {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

/// Remembers extensions whose launch failed
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    failures: HashMap<String, Instant>,
}

impl FailureTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed launch
    pub fn record_failure(&mut self, name: &str, at: Instant) {
        debug!("Recorded failed launch of '{}'", name);
        self.failures.insert(name.to_string(), at);
    }

    /// Forget a failure after a successful launch
    pub fn clear(&mut self, name: &str) {
        self.failures.remove(name);
    }

    /// Time still to wait before `name` may be launched again
    pub fn remaining_delay(&self, name: &str, retry_wait: Duration, now: Instant) -> Option<Duration> {
        let failed_at = self.failures.get(name)?;
        match failed_at.checked_add(retry_wait) {
            Some(ready_at) => ready_at.checked_duration_since(now).filter(|d| !d.is_zero()),
            None => Some(retry_wait),
        }
    }

    /// Number of extensions with a recorded failure
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no failures are recorded
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
