//! Reconciliation of the running extensions against a desired configuration

use super::{Inner, ReconcileReport, StopOutcome};
use crate::config::validate_extension;
use crate::registry::ExtensionRecord;
use crate::{CoreError, Result};
use nix::sys::signal::Signal;
use schema::{ExtensionMetadata, ExtensionStatus};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

impl Inner {
    pub(super) async fn reconcile(self: &Arc<Self>, config: &[ExtensionMetadata]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let desired = desired_extensions(config, &mut report);
        self.drain_stale_exit_events().await;

        let mut restarts = Vec::new();
        for metadata in &desired {
            match self.registry.get(&metadata.name) {
                None => match self.launch_new(metadata).await {
                    Ok(_) => report.started.push(metadata.name.clone()),
                    Err(e) => report.fail(&metadata.name, e),
                },
                Some(current) if current.status == ExtensionStatus::Killing => {
                    debug!(
                        "Extension '{}' (pid {}) is stopping, relaunching after it exits",
                        metadata.name, current.pid
                    );
                    restarts.push(metadata.clone());
                }
                Some(current) if current.metadata == *metadata => {
                    debug!("Extension '{}' unchanged", metadata.name);
                }
                Some(current) => {
                    info!(
                        "Extension '{}' definition changed, restarting pid {}",
                        metadata.name, current.pid
                    );
                    restarts.push(metadata.clone());
                }
            }
        }

        // stop every queued extension, remembering whose exit we wait for
        let mut owed: HashMap<i32, ExtensionMetadata> = HashMap::new();
        let mut replacements = Vec::new();
        for metadata in restarts {
            match self.stop(&metadata.name).await {
                Ok(StopOutcome::NotFound) => replacements.push(metadata),
                Ok(outcome) => {
                    if let Some(pid) = outcome.pid() {
                        owed.insert(pid, metadata);
                    }
                }
                Err(e) => report.fail(&metadata.name, e),
            }
        }

        let wanted: HashSet<&str> = desired.iter().map(|m| m.name.as_str()).collect();
        for name in self.registry.names() {
            if wanted.contains(name.as_str()) {
                continue;
            }
            match self.stop(&name).await {
                Ok(StopOutcome::Signalled { .. }) | Ok(StopOutcome::Completed { .. }) => {
                    info!("Stopped obsolete extension '{}'", name);
                    report.stopped.push(name);
                }
                Ok(_) => {}
                Err(e) => report.fail(&name, e),
            }
        }

        if !owed.is_empty() {
            let pids: HashSet<i32> = owed.keys().copied().collect();
            let confirmed = self
                .wait_for_exits(&pids, self.settings.stop_wait_timeout())
                .await;
            let pending = self.registry.drain_pending_exits();
            for (pid, metadata) in owed {
                if confirmed.contains(&pid) || pending.contains(&pid) {
                    replacements.push(metadata);
                } else {
                    report.fail(
                        &metadata.name,
                        CoreError::SyncError(format!(
                            "timed out waiting for pid {} to exit",
                            pid
                        )),
                    );
                }
            }
        } else {
            self.registry.drain_pending_exits();
        }

        for metadata in replacements {
            match self.launch_new(&metadata).await {
                Ok(_) => report.restarted.push(metadata.name.clone()),
                Err(e) => report.fail(&metadata.name, e),
            }
        }

        report
    }

    /// Launch an extension that is not in the registry
    ///
    /// An extension whose previous launch failed waits out the retry delay
    /// first.
    pub(super) async fn launch_new(&self, metadata: &ExtensionMetadata) -> Result<i32> {
        let delay =
            self.failed_spawns()
                .remaining_delay(&metadata.name, self.policy.retry_wait(), Instant::now());
        if let Some(delay) = delay {
            info!(
                "Waiting {:?} before retrying failed launch of '{}'",
                delay, metadata.name
            );
            tokio::time::sleep(delay).await;
        }
        self.launch_and_record(metadata.clone()).await
    }

    /// Launch under the spawn gate and record the new process
    pub(super) async fn launch_and_record(&self, metadata: ExtensionMetadata) -> Result<i32> {
        let _gate = self.spawn_gate.lock().await;

        let pid = match self.control.launch(&metadata).await {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to launch extension '{}': {}", metadata.name, e);
                self.failed_spawns()
                    .record_failure(&metadata.name, Instant::now());
                return Err(e);
            }
        };
        self.failed_spawns().clear(&metadata.name);

        let name = metadata.name.clone();
        if let Err(e) = self.registry.add(ExtensionRecord::new(metadata, pid)) {
            error!("Failed to record extension '{}' (pid {}): {}", name, pid, e);
            if let Err(kill_err) = self.control.send_signal(pid, Signal::SIGKILL) {
                error!("Failed to kill unrecorded pid {}: {}", pid, kill_err);
            }
            return Err(e);
        }
        info!("Started extension '{}' with pid {}", name, pid);
        Ok(pid)
    }

    /// Drop exit events nobody is waiting for
    pub(super) async fn drain_stale_exit_events(&self) {
        let mut events = self.exit_rx.lock().await;
        while let Ok(pid) = events.try_recv() {
            debug!("Discarding stale exit event for pid {}", pid);
        }
    }

    /// Wait until an exit event was seen for every owed pid, or the timeout
    /// expires. Returns the pids that were confirmed.
    pub(super) async fn wait_for_exits(&self, owed: &HashSet<i32>, timeout: Duration) -> HashSet<i32> {
        let mut events = self.exit_rx.lock().await;
        let mut confirmed = HashSet::new();
        let deadline = tokio::time::Instant::now() + timeout;

        while confirmed.len() < owed.len() {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(pid)) if owed.contains(&pid) => {
                    debug!("Confirmed exit of pid {}", pid);
                    confirmed.insert(pid);
                }
                Ok(Some(pid)) => debug!("Ignoring exit event for unrelated pid {}", pid),
                Ok(None) => {
                    error!("Exit event channel closed while waiting for extensions");
                    break;
                }
                Err(_) => {
                    warn!(
                        "Timed out after {:?} waiting for {} extension exit(s)",
                        timeout,
                        owed.len() - confirmed.len()
                    );
                    break;
                }
            }
        }
        confirmed
    }
}

/// Valid, de-duplicated entries of `config`, in order
///
/// Invalid entries and later duplicates are reported as failures and skipped.
fn desired_extensions(config: &[ExtensionMetadata], report: &mut ReconcileReport) -> Vec<ExtensionMetadata> {
    let mut seen = HashSet::new();
    let mut desired = Vec::with_capacity(config.len());
    for (i, metadata) in config.iter().enumerate() {
        if let Err(msg) = validate_extension(metadata) {
            let error = CoreError::ConfigurationError(format!("extension[{}].{}", i, msg));
            error!("Skipping invalid extension: {}", error);
            report.fail(&metadata.name, error);
            continue;
        }
        if !seen.insert(metadata.name.as_str()) {
            let error = CoreError::ConfigurationError(format!(
                "extension[{}].name: duplicate name '{}'",
                i, metadata.name
            ));
            error!("Skipping duplicate extension: {}", error);
            report.fail(&metadata.name, error);
            continue;
        }
        desired.push(metadata.clone());
    }
    desired
}
