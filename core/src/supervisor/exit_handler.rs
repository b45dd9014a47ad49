//! Child-exit handling: reaping, crash retries and stop confirmation

use super::{ExitNotifications, Inner, RetryDecision};
use crate::registry::ExtensionRecord;
use nix::sys::signal::Signal;
use schema::{ChildExit, ExtensionStatus};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What an exit meant for its extension
#[derive(Debug)]
enum ExitDisposition {
    Crashed { name: String, decision: RetryDecision },
    Stopped { name: String },
    Stale { name: String },
}

/// Wake up on every exit notification and reap
///
/// Holds only a weak reference so the supervisor can be dropped while the
/// pump waits.
pub(super) async fn run_exit_pump(
    supervisor: Weak<Inner>,
    mut notifications: Box<dyn ExitNotifications>,
) {
    debug!("Extension exit pump running");
    while notifications.recv().await.is_some() {
        let Some(inner) = supervisor.upgrade() else {
            break;
        };
        inner.reap_pass().await;
    }
    debug!("Extension exit pump finished");
}

impl Inner {
    /// Reap every exited child under the spawn gate
    pub(super) async fn reap_pass(self: &Arc<Self>) {
        let _gate = self.spawn_gate.lock().await;
        loop {
            let exits = match self.control.reap_exited() {
                Ok(exits) => exits,
                Err(e) => {
                    error!("Failed to reap exited extensions: {}", e);
                    return;
                }
            };
            if exits.is_empty() {
                break;
            }
            for exit in exits {
                self.handle_exit(exit);
            }
        }
    }

    fn handle_exit(self: &Arc<Self>, exit: ChildExit) {
        let policy = self.policy;
        let disposition = self.registry.update_by_pid(exit.pid, |record| {
            let name = record.name().to_string();
            match record.status {
                ExtensionStatus::Normal => {
                    let decision = policy.on_crash(record.retry_count, record.uptime());
                    record.retry_count = decision.retry_count();
                    record.status = match decision {
                        RetryDecision::Relaunch { .. } => ExtensionStatus::Bad,
                        RetryDecision::GiveUp { .. } => ExtensionStatus::Exit,
                    };
                    ExitDisposition::Crashed { name, decision }
                }
                ExtensionStatus::Killing | ExtensionStatus::Exit => {
                    record.status = ExtensionStatus::Exit;
                    ExitDisposition::Stopped { name }
                }
                ExtensionStatus::Bad => ExitDisposition::Stale { name },
            }
        });

        match disposition {
            None => warn!("Reaped child not owned by any extension ({})", exit),
            Some(ExitDisposition::Crashed {
                name,
                decision: RetryDecision::Relaunch { delay, retry_count },
            }) => {
                warn!(
                    "Extension '{}' exited unexpectedly ({}), relaunching in {:?} (retry {} of {})",
                    name, exit, delay, retry_count, self.settings.max_retries
                );
                self.schedule_relaunch(name, exit.pid, delay);
            }
            Some(ExitDisposition::Crashed {
                name,
                decision: RetryDecision::GiveUp { retry_count },
            }) => {
                error!(
                    "Extension '{}' exited unexpectedly ({}) {} times within {:?}, giving up",
                    name,
                    exit,
                    retry_count,
                    self.settings.crash_window()
                );
                if let Err(e) = self.registry.delete(&name) {
                    error!("Failed to remove extension '{}': {}", name, e);
                }
            }
            Some(ExitDisposition::Stopped { name }) => {
                info!("Extension '{}' stopped ({})", name, exit);
                if let Err(e) = self.registry.delete(&name) {
                    error!("Failed to remove stopped extension '{}': {}", name, e);
                }
                self.announce_exit(exit.pid);
            }
            Some(ExitDisposition::Stale { name }) => {
                debug!("Ignoring repeated exit of '{}' ({})", name, exit);
            }
        }
    }

    fn schedule_relaunch(self: &Arc<Self>, name: String, old_pid: i32, delay: Duration) {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = supervisor.upgrade() {
                inner.relaunch(&name, old_pid).await;
            }
        });
    }

    /// Relaunch a crashed extension if it is still waiting for it
    async fn relaunch(&self, name: &str, old_pid: i32) {
        let _gate = self.spawn_gate.lock().await;

        let metadata = match self.registry.get(name) {
            Some(current) if current.status == ExtensionStatus::Bad && current.pid == old_pid => {
                current.metadata
            }
            _ => {
                debug!("Relaunch of '{}' no longer needed", name);
                return;
            }
        };

        match self.control.launch(&metadata).await {
            Ok(new_pid) => {
                if let Err(e) = self.registry.update_pid(name, old_pid, new_pid) {
                    error!("Failed to record relaunched '{}' (pid {}): {}", name, new_pid, e);
                    if let Err(kill_err) = self.control.send_signal(new_pid, Signal::SIGKILL) {
                        error!("Failed to kill unrecorded pid {}: {}", new_pid, kill_err);
                    }
                    return;
                }
                self.registry.update(name, ExtensionRecord::mark_relaunched);
                info!("Relaunched extension '{}' with pid {}", name, new_pid);
            }
            Err(e) => {
                error!("Failed to relaunch extension '{}': {}", name, e);
                if let Err(e) = self.registry.delete(name) {
                    error!("Failed to remove extension '{}': {}", name, e);
                }
                self.failed_spawns().record_failure(name, Instant::now());
            }
        }
    }
}
