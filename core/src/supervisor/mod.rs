//! Extension supervisor implementation
//!
//! This module keeps the configured extensions running: it diffs a desired
//! configuration against the registry, restarts changed extensions, stops
//! obsolete ones, relaunches crashed ones within a retry budget, and stops
//! everything at shutdown.
//!
//! ## Architecture
//!
//! ```text
//! start_extensions ──► reconcile ──► launch / stop ──► ProcessControl
//!                                          ▲                 │
//!                 exit events ◄── exit pump ◄── SIGCHLD wake-ups
//! ```
//!
//! Each extension moves through these statuses:
//!
//! ```text
//! Normal ──crash──► Bad ──relaunch──► Normal
//!   │                │ (budget exhausted: removed)
//!   └──stop──► Killing ──exit──► Exit (removed)
//! ```
//!
//! ## Components
//!
//! - [`ExtensionSupervisor`]: cloneable handle exposing the public operations
//! - [`ProcessControl`]: trait abstracting launch, signal and reap
//! - [`CrashLoopPolicy`]: crash-loop retry decisions
//!
//! ## Concurrency
//!
//! A spawn gate (async mutex) is held across launch plus registry insert,
//! across every stop, and across each reap pass, so an exit is never handled
//! before its pid is recorded and a pid is never signalled after it was
//! reaped. Reconciliation runs and `stop_all_extensions` are serialized by a
//! second guard. Confirmed stops are announced on an exit-event channel and
//! waiters only consume the pids they are owed.

use crate::registry::ExtensionRegistry;
use crate::Result;
use schema::{ExtensionMetadata, ExtensionSnapshot, SupervisorSettings};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod adapters;
mod exit_handler;
mod reconcile;
pub mod retry_policy;
mod stop;

#[cfg(test)]
mod integration_tests;

pub use adapters::*;
pub use retry_policy::*;
pub use stop::StopOutcome;

/// One extension that could not be brought to its desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    /// Extension name (may be empty for invalid entries)
    pub name: String,
    /// What went wrong
    pub error: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Extensions launched for the first time
    pub started: Vec<String>,
    /// Extensions relaunched with a changed definition
    pub restarted: Vec<String>,
    /// Obsolete extensions asked to stop
    pub stopped: Vec<String>,
    /// Errors, one per affected extension
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// Whether every extension reached its desired state
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, name: &str, error: impl fmt::Display) {
        self.failures.push(ReconcileFailure {
            name: name.to_string(),
            error: error.to_string(),
        });
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} started, {} restarted, {} stopped, {} failed",
            self.started.len(),
            self.restarted.len(),
            self.stopped.len(),
            self.failures.len()
        )
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared supervisor state
pub(crate) struct Inner {
    registry: ExtensionRegistry,
    control: Arc<dyn ProcessControl>,
    settings: SupervisorSettings,
    policy: CrashLoopPolicy,
    spawn_gate: Mutex<()>,
    reconcile_guard: Mutex<()>,
    exit_tx: mpsc::UnboundedSender<i32>,
    exit_rx: Mutex<mpsc::UnboundedReceiver<i32>>,
    failed_spawns: StdMutex<FailureTracker>,
    last_run: StdMutex<Option<JoinHandle<ReconcileReport>>>,
    stopping: AtomicBool,
    exit_pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn failed_spawns(&self) -> MutexGuard<'_, FailureTracker> {
        lock(&self.failed_spawns)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Announce that `pid` finished stopping
    fn announce_exit(&self, pid: i32) {
        self.registry.record_pending_exit(pid);
        if self.exit_tx.send(pid).is_err() {
            error!("Exit event channel closed, dropping event for pid {}", pid);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.exit_pump).take() {
            pump.abort();
        }
    }
}

/// Handle to the extension supervisor
///
/// Cloning is cheap; all clones drive the same registry.
#[derive(Clone)]
pub struct ExtensionSupervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ExtensionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionSupervisor")
            .field("settings", &self.inner.settings)
            .field("extensions", &self.inner.registry.len())
            .finish()
    }
}

impl ExtensionSupervisor {
    /// Create a supervisor and start its exit pump
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(control: Arc<dyn ProcessControl>, settings: SupervisorSettings) -> Result<Self> {
        crate::config::validate_settings(&settings)?;
        let notifications = control.subscribe_exits()?;
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            registry: ExtensionRegistry::new(),
            control,
            settings,
            policy: CrashLoopPolicy::from_settings(&settings),
            spawn_gate: Mutex::new(()),
            reconcile_guard: Mutex::new(()),
            exit_tx,
            exit_rx: Mutex::new(exit_rx),
            failed_spawns: StdMutex::new(FailureTracker::new()),
            last_run: StdMutex::new(None),
            stopping: AtomicBool::new(false),
            exit_pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(exit_handler::run_exit_pump(
            Arc::downgrade(&inner),
            notifications,
        ));
        *lock(&inner.exit_pump) = Some(pump);

        info!(
            "Extension supervisor started (grace {:?}, max retries {}, retry wait {:?})",
            settings.terminate_grace(),
            settings.max_retries,
            settings.retry_wait()
        );
        Ok(Self { inner })
    }

    /// Create a supervisor that launches real processes
    #[cfg(unix)]
    pub fn with_unix_control(settings: SupervisorSettings) -> Result<Self> {
        Self::new(Arc::new(UnixProcessControl::new()), settings)
    }

    /// Active settings
    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Registry of supervised extensions
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.inner.registry
    }

    /// Converge the running extensions to `config`
    ///
    /// Launches nothing once `stop_all_extensions` has been called.
    pub async fn start_extensions(&self, config: &[ExtensionMetadata]) -> ReconcileReport {
        let _guard = self.inner.reconcile_guard.lock().await;
        if self.inner.is_stopping() {
            warn!(
                "Supervisor is stopping, ignoring {} configured extension(s)",
                config.len()
            );
            let mut report = ReconcileReport::default();
            report.fail("", "supervisor is stopping");
            return report;
        }
        info!("Reconciling {} configured extension(s)", config.len());
        let report = self.inner.reconcile(config).await;
        if report.is_success() {
            info!("Extension reconciliation finished: {}", report);
        } else {
            for failure in &report.failures {
                error!("Extension '{}': {}", failure.name, failure.error);
            }
            error!("Extension reconciliation finished with errors: {}", report);
        }
        report
    }

    /// Reconcile in the background
    ///
    /// Does nothing when both `config` and the registry are empty. Runs are
    /// chained: each one waits for the previous run and logs its failure.
    pub fn start_extensions_async(&self, config: Vec<ExtensionMetadata>) {
        if self.inner.is_stopping() {
            debug!("Supervisor is stopping, skipping reconciliation");
            return;
        }
        if config.is_empty() && self.inner.registry.is_empty() {
            debug!("No extensions configured or running, skipping reconciliation");
            return;
        }

        let mut last_run = lock(&self.inner.last_run);
        let previous = last_run.take();
        let supervisor = self.clone();
        *last_run = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                match previous.await {
                    Ok(report) if !report.is_success() => {
                        error!("Previous extension reconciliation failed: {}", report)
                    }
                    Ok(_) => {}
                    Err(e) => error!("Previous extension reconciliation task failed: {}", e),
                }
            }
            supervisor.start_extensions(&config).await
        }));
    }

    /// Wait for the most recent background reconciliation, if any
    pub async fn settle(&self) -> Option<ReconcileReport> {
        let handle = lock(&self.inner.last_run).take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Extension reconciliation task failed: {}", e);
                None
            }
        }
    }

    /// Gracefully stop one extension
    ///
    /// Sends SIGINT and arms the SIGKILL timer. The record is removed once the
    /// exit is observed.
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        self.inner.stop(name).await
    }

    /// Stop every extension and wait for them to exit
    ///
    /// Background reconciliations already queued are waited for first and
    /// launch nothing; later start requests are ignored. Returns true when
    /// every extension stopped within the wait timeout.
    pub async fn stop_all_extensions(&self) -> bool {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let queued = lock(&self.inner.last_run).take();
        if let Some(queued) = queued {
            debug!("Waiting for queued extension reconciliation before stopping");
            if let Err(e) = queued.await {
                error!("Extension reconciliation task failed: {}", e);
            }
        }

        let _guard = self.inner.reconcile_guard.lock().await;
        self.inner.stop_all().await
    }

    /// Snapshots of every supervised extension, sorted by name
    pub fn status(&self) -> Vec<ExtensionSnapshot> {
        self.inner.registry.snapshots()
    }

    /// Snapshot of one extension
    pub fn status_of(&self, name: &str) -> Option<ExtensionSnapshot> {
        self.inner.registry.get(name)
    }

    /// Stop the exit pump. Extensions are left running.
    pub fn shutdown(&self) {
        if let Some(pump) = lock(&self.inner.exit_pump).take() {
            pump.abort();
            debug!("Extension exit pump stopped");
        }
    }
}
