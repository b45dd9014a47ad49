//! Stop tests: graceful stop, forced kill after the grace period, and
//! repeated stop requests

use super::{ext, fast_settings, supervisor_with};
use crate::supervisor::{ExtensionSupervisor, MockProcessControl, StopOutcome};
use nix::sys::signal::Signal;
use schema::{ExtensionStatus, SupervisorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn test_stop_all_graceful() {
    let (supervisor, control) = supervisor_with(fast_settings());
    supervisor
        .start_extensions(&[ext("alpha", "alpha"), ext("beta", "beta")])
        .await;
    let pids: Vec<i32> = supervisor.status().iter().map(|s| s.pid).collect();

    assert!(supervisor.stop_all_extensions().await);
    assert!(supervisor.status().is_empty());
    assert_eq!(control.running_count(), 0);

    // cancelled timers never fire
    sleep(Duration::from_millis(1300)).await;
    for pid in pids {
        assert_eq!(control.signal_count(pid, Signal::SIGINT), 1);
        assert_eq!(control.signal_count(pid, Signal::SIGKILL), 0);
    }
}

#[tokio::test]
async fn test_stop_all_forces_stubborn_extension() {
    let (supervisor, control) = supervisor_with(fast_settings());
    control.ignore_interrupt("stubborn");
    supervisor
        .start_extensions(&[ext("stubborn", "stubborn"), ext("polite", "polite")])
        .await;
    let stubborn = supervisor.status_of("stubborn").unwrap().pid;
    let polite = supervisor.status_of("polite").unwrap().pid;

    let started = tokio::time::Instant::now();
    assert!(supervisor.stop_all_extensions().await);
    assert!(started.elapsed() >= Duration::from_millis(900));

    assert_eq!(control.signal_count(stubborn, Signal::SIGINT), 1);
    assert_eq!(control.signal_count(stubborn, Signal::SIGKILL), 1);
    assert_eq!(control.signal_count(polite, Signal::SIGKILL), 0);
    assert_eq!(control.running_count(), 0);
    assert!(supervisor.status().is_empty());
}

#[tokio::test]
async fn test_repeated_stop_sends_one_signal_and_one_kill() {
    let (supervisor, control) = supervisor_with(fast_settings());
    control.ignore_interrupt("stubborn");
    supervisor.start_extensions(&[ext("stubborn", "stubborn")]).await;
    let pid = supervisor.status_of("stubborn").unwrap().pid;

    assert_eq!(
        supervisor.stop("stubborn").await.unwrap(),
        StopOutcome::Signalled { pid }
    );
    assert_eq!(
        supervisor.stop("stubborn").await.unwrap(),
        StopOutcome::AlreadyStopping { pid }
    );
    assert_eq!(
        supervisor.status_of("stubborn").unwrap().status,
        ExtensionStatus::Killing
    );

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(control.signal_count(pid, Signal::SIGINT), 1);
    assert_eq!(control.signal_count(pid, Signal::SIGKILL), 1);
    assert!(supervisor.status_of("stubborn").is_none());
    assert!(supervisor.registry().drain_pending_exits().contains(&pid));
}

#[tokio::test]
async fn test_stop_unknown_extension() {
    let (supervisor, control) = supervisor_with(fast_settings());
    assert_eq!(
        supervisor.stop("ghost").await.unwrap(),
        StopOutcome::NotFound
    );
    assert!(supervisor.stop_all_extensions().await);
    assert!(control.signals().is_empty());
}

#[tokio::test]
async fn test_stop_all_wins_over_queued_reconciliation() {
    let (supervisor, control) = supervisor_with(fast_settings());
    supervisor.start_extensions_async(vec![ext("alpha", "alpha")]);
    supervisor.start_extensions_async(vec![ext("alpha", "alpha"), ext("beta", "beta")]);

    assert!(supervisor.stop_all_extensions().await);
    assert!(supervisor.settle().await.is_none());
    sleep(Duration::from_millis(50)).await;
    assert_eq!(control.running_count(), 0);
    assert!(control.launches().is_empty());
    assert!(supervisor.status().is_empty());

    // nothing new starts once stopping
    supervisor.start_extensions_async(vec![ext("gamma", "gamma")]);
    assert!(supervisor.settle().await.is_none());
    let report = supervisor.start_extensions(&[ext("gamma", "gamma")]).await;
    assert!(!report.is_success());
    assert!(report.started.is_empty());
    assert!(control.launches().is_empty());
}

#[tokio::test]
async fn test_stop_all_waits_for_running_reconciliation() {
    let (supervisor, control) = supervisor_with(fast_settings());
    supervisor.start_extensions(&[ext("alpha", "alpha --v1")]).await;

    // the restart is mid-flight when the stop arrives
    supervisor.start_extensions_async(vec![ext("alpha", "alpha --v2")]);
    tokio::task::yield_now().await;
    assert!(supervisor.stop_all_extensions().await);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(control.running_count(), 0);
    assert!(supervisor.status().is_empty());
}

#[tokio::test]
async fn test_oversized_stop_wait_is_rejected() {
    let settings = SupervisorSettings {
        stop_wait_slack_secs: i64::MAX as u64,
        ..fast_settings()
    };
    let err = ExtensionSupervisor::new(Arc::new(MockProcessControl::new()), settings).unwrap_err();
    assert_eq!(err.code(), "CORE002");
}
