//! Graceful and forced stops

use super::Inner;
use crate::registry::KillTimer;
use crate::Result;
use nix::sys::signal::Signal;
use schema::ExtensionStatus;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// SIGINT was sent and the SIGKILL timer armed
    Signalled { pid: i32 },
    /// The extension was already stopping; nothing was sent
    AlreadyStopping { pid: i32 },
    /// There was no live process; the stop completed immediately
    Completed { pid: i32 },
    /// No extension with that name
    NotFound,
}

impl StopOutcome {
    /// Pid whose exit confirms this stop
    pub fn pid(&self) -> Option<i32> {
        match self {
            StopOutcome::Signalled { pid }
            | StopOutcome::AlreadyStopping { pid }
            | StopOutcome::Completed { pid } => Some(*pid),
            StopOutcome::NotFound => None,
        }
    }
}

impl Inner {
    pub(super) async fn stop(self: &Arc<Self>, name: &str) -> Result<StopOutcome> {
        let _gate = self.spawn_gate.lock().await;

        let Some((prior, pid)) = self.registry.update(name, |record| {
            let prior = record.status;
            record.status = ExtensionStatus::Killing;
            (prior, record.pid)
        }) else {
            debug!("Stop requested for unknown extension '{}'", name);
            return Ok(StopOutcome::NotFound);
        };

        match prior {
            ExtensionStatus::Killing => {
                debug!("Extension '{}' (pid {}) is already stopping", name, pid);
                Ok(StopOutcome::AlreadyStopping { pid })
            }
            ExtensionStatus::Normal => {
                info!("Stopping extension '{}' (pid {}) with SIGINT", name, pid);
                match self.control.send_signal(pid, Signal::SIGINT) {
                    Ok(true) => {
                        self.arm_kill_timer(name, pid);
                        Ok(StopOutcome::Signalled { pid })
                    }
                    Ok(false) => {
                        warn!("Extension '{}' (pid {}) vanished before SIGINT", name, pid);
                        self.complete_stop(name, pid);
                        Ok(StopOutcome::Completed { pid })
                    }
                    Err(e) => {
                        error!("Failed to interrupt extension '{}' (pid {}): {}", name, pid, e);
                        self.arm_kill_timer(name, pid);
                        Err(e)
                    }
                }
            }
            ExtensionStatus::Bad | ExtensionStatus::Exit => {
                debug!(
                    "Extension '{}' has no live process ({}), stop completes now",
                    name, prior
                );
                self.complete_stop(name, pid);
                Ok(StopOutcome::Completed { pid })
            }
        }
    }

    /// Remove a stopped extension and announce its pid
    fn complete_stop(&self, name: &str, pid: i32) {
        if let Err(e) = self.registry.delete(name) {
            error!("Failed to remove stopped extension '{}': {}", name, e);
        }
        self.announce_exit(pid);
    }

    fn arm_kill_timer(self: &Arc<Self>, name: &str, pid: i32) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let supervisor = Arc::downgrade(self);
        let grace = self.settings.terminate_grace();
        let owner = name.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if flag.load(Ordering::SeqCst) {
                return;
            }
            if let Some(inner) = supervisor.upgrade() {
                inner.force_kill(&owner, pid, &flag).await;
            }
        });

        let timer = KillTimer::new(cancelled, task);
        match self.registry.update(name, move |record| record.arm_kill_timer(timer)) {
            Some(true) => debug!("Armed {:?} kill timer for '{}' (pid {})", grace, name, pid),
            Some(false) => debug!("Kill timer for '{}' already armed", name),
            None => debug!("Extension '{}' vanished before its kill timer was armed", name),
        }
    }

    async fn force_kill(&self, name: &str, pid: i32, cancelled: &AtomicBool) {
        let _gate = self.spawn_gate.lock().await;
        if cancelled.load(Ordering::SeqCst) {
            return;
        }

        match self.registry.get(name) {
            Some(current) if current.pid == pid && current.status == ExtensionStatus::Killing => {
                warn!(
                    "Extension '{}' (pid {}) did not exit within {:?}, sending SIGKILL",
                    name,
                    pid,
                    self.settings.terminate_grace()
                );
                if let Err(e) = self.control.send_signal(pid, Signal::SIGKILL) {
                    error!("Failed to kill extension '{}' (pid {}): {}", name, pid, e);
                }
            }
            _ => debug!("Kill timer for '{}' (pid {}) no longer applies", name, pid),
        }
    }

    pub(super) async fn stop_all(self: &Arc<Self>) -> bool {
        self.drain_stale_exit_events().await;

        let names = self.registry.names();
        info!("Stopping {} extension(s)", names.len());

        let mut success = true;
        let mut owed = HashSet::new();
        for name in names {
            match self.stop(&name).await {
                Ok(StopOutcome::Signalled { pid }) | Ok(StopOutcome::AlreadyStopping { pid }) => {
                    owed.insert(pid);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to stop extension '{}': {}", name, e);
                    success = false;
                }
            }
        }

        if !owed.is_empty() {
            let confirmed = self
                .wait_for_exits(&owed, self.settings.stop_wait_timeout())
                .await;
            if confirmed.len() < owed.len() {
                error!(
                    "{} extension(s) did not exit within {:?}",
                    owed.len() - confirmed.len(),
                    self.settings.stop_wait_timeout()
                );
                success = false;
            }
        }

        self.registry.drain_pending_exits();
        let leftover = self.registry.delete_all();
        if leftover > 0 {
            warn!("Removed {} extension record(s) left after stopping", leftover);
        }
        info!("Extensions stopped (success: {})", success);
        success
    }
}
