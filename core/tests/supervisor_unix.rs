//! Integration tests for the supervisor against real processes
//!
//! Extensions are `/bin/sh` one-liners launched through the Unix process
//! control, so exits arrive through `SIGCHLD` and the exit pump.

#![cfg(unix)]

use extvisor_core::{ExtensionMetadata, ExtensionStatus, ExtensionSupervisor, SupervisorSettings};
use std::fs;
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        terminate_grace_secs: 1,
        max_retries: 2,
        retry_wait_secs: 0,
        crash_window_secs: 60,
        stop_wait_slack_secs: 2,
    }
}

fn shell(name: &str, script: &str) -> ExtensionMetadata {
    ExtensionMetadata::new(name, format!("/bin/sh -c \"{}\"", script), "", "")
}

fn process_exists(pid: i32) -> bool {
    // signal 0 only checks for existence
    unsafe { libc::kill(pid, 0) == 0 }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_start_and_stop_all() {
    let supervisor = ExtensionSupervisor::with_unix_control(settings()).unwrap();
    let report = supervisor
        .start_extensions(&[
            shell("sleeper-a", "exec sleep 30"),
            shell("sleeper-b", "exec sleep 30"),
        ])
        .await;
    assert!(report.is_success(), "{report:?}");

    let pids: Vec<i32> = supervisor.status().iter().map(|s| s.pid).collect();
    assert_eq!(pids.len(), 2);
    assert!(pids.iter().all(|pid| process_exists(*pid)));

    let started = Instant::now();
    assert!(supervisor.stop_all_extensions().await);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(supervisor.status().is_empty());
    // reaped, so the pids no longer exist
    assert!(pids.iter().all(|pid| !process_exists(*pid)));
}

#[tokio::test]
async fn test_stubborn_extension_is_killed_after_grace() {
    let supervisor = ExtensionSupervisor::with_unix_control(settings()).unwrap();
    supervisor
        .start_extensions(&[shell(
            "stubborn",
            "trap '' INT; while true; do sleep 0.1; done",
        )])
        .await;
    let pid = supervisor.status_of("stubborn").unwrap().pid;
    // give the shell time to install its trap
    sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    assert!(supervisor.stop_all_extensions().await);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(supervisor.status().is_empty());
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn test_crashing_extension_gives_up_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("runs.log");
    let supervisor = ExtensionSupervisor::with_unix_control(settings()).unwrap();

    let report = supervisor
        .start_extensions(&[shell(
            "crasher",
            &format!("echo run >> {}; exit 3", log.display()),
        )])
        .await;
    assert!(report.is_success(), "{report:?}");

    eventually("crasher to be given up", || {
        supervisor.status_of("crasher").is_none()
    })
    .await;
    // first launch plus two relaunches
    assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 3);
}

#[tokio::test]
async fn test_crashed_extension_comes_back() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crashed-once");
    let supervisor = ExtensionSupervisor::with_unix_control(settings()).unwrap();

    // crash on the first run only
    let script = format!(
        "if [ -e {m} ]; then exec sleep 30; else touch {m}; exit 1; fi",
        m = marker.display()
    );
    supervisor
        .start_extensions(&[shell("phoenix", &script)])
        .await;
    let first = supervisor.status_of("phoenix").unwrap().pid;

    eventually("phoenix to be relaunched", || {
        supervisor
            .status_of("phoenix")
            .map(|s| s.pid != first && s.status == ExtensionStatus::Normal)
            .unwrap_or(false)
    })
    .await;
    let current = supervisor.status_of("phoenix").unwrap();
    assert_eq!(current.retry_count, 1);
    assert!(process_exists(current.pid));

    assert!(supervisor.stop_all_extensions().await);
}

#[tokio::test]
async fn test_failed_exec_leaves_extension_absent() {
    let supervisor = ExtensionSupervisor::with_unix_control(settings()).unwrap();
    let report = supervisor
        .start_extensions(&[ExtensionMetadata::new(
            "missing",
            "definitely-not-a-real-extension-binary --flag",
            "",
            "",
        )])
        .await;

    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "missing");
    assert!(supervisor.status_of("missing").is_none());
}
