//! Integration test modules for the extension supervisor
//!
//! Every suite drives an [`ExtensionSupervisor`] against the mock process
//! control, so crashes and stubborn processes can be scripted.

#[path = "reconcile_tests.rs"]
mod reconcile_tests;

#[path = "crash_retry_tests.rs"]
mod crash_retry_tests;

#[path = "stop_tests.rs"]
mod stop_tests;

use crate::supervisor::{ExtensionSupervisor, MockProcessControl};
use schema::{ExtensionMetadata, SupervisorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Settings with a one second grace period and immediate relaunches
pub(crate) fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        terminate_grace_secs: 1,
        max_retries: 3,
        retry_wait_secs: 0,
        crash_window_secs: 60,
        stop_wait_slack_secs: 1,
    }
}

pub(crate) fn ext(name: &str, command_line: &str) -> ExtensionMetadata {
    ExtensionMetadata::new(name, command_line, "", "")
}

pub(crate) fn supervisor_with(
    settings: SupervisorSettings,
) -> (ExtensionSupervisor, MockProcessControl) {
    let control = MockProcessControl::new();
    let supervisor =
        ExtensionSupervisor::new(Arc::new(control.clone()), settings).expect("supervisor");
    (supervisor, control)
}

/// Poll `condition` until it holds, panicking after five seconds
pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}
