//! Process control adapters for the extension supervisor
//!
//! The supervisor never calls the operating system directly. It launches,
//! signals and reaps extensions through [`ProcessControl`], which lets the
//! reconciliation and retry logic run against [`MockProcessControl`] in tests
//! and against [`UnixProcessControl`] in the daemon.

use crate::{CoreError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use schema::{ChildExit, ExtensionMetadata};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error};

/// Launch, signal and reap extension processes
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch an extension and return its pid once exec has succeeded
    async fn launch(&self, metadata: &ExtensionMetadata) -> Result<i32>;

    /// Send a signal. `Ok(false)` means the process no longer exists.
    fn send_signal(&self, pid: i32, signal: Signal) -> Result<bool>;

    /// Reap every launched child that has exited, without blocking
    fn reap_exited(&self) -> Result<Vec<ChildExit>>;

    /// Subscribe to "some child exited" wake-ups
    fn subscribe_exits(&self) -> Result<Box<dyn ExitNotifications>>;
}

/// Stream of child-exit wake-ups
///
/// A wake-up carries no pid. Several exits may collapse into one wake-up, so
/// the receiver must reap until nothing is left.
#[async_trait]
pub trait ExitNotifications: Send {
    /// Wait for the next wake-up. `None` means no more will arrive.
    async fn recv(&mut self) -> Option<()>;
}

/// Unix process control backed by fork/exec and `SIGCHLD`
///
/// Only children launched through this adapter are reaped, each with a
/// pid-specific non-blocking wait.
#[cfg(unix)]
#[derive(Clone, Debug, Default)]
pub struct UnixProcessControl {
    launched: Arc<Mutex<HashSet<i32>>>,
}

#[cfg(unix)]
impl UnixProcessControl {
    /// Create a new Unix process control
    pub fn new() -> Self {
        Self::default()
    }

    fn launched(&self) -> MutexGuard<'_, HashSet<i32>> {
        self.launched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of launched children not reaped yet
    pub fn outstanding(&self) -> usize {
        self.launched().len()
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessControl for UnixProcessControl {
    async fn launch(&self, metadata: &ExtensionMetadata) -> Result<i32> {
        use crate::process::unix;

        let metadata = metadata.clone();
        let pid = tokio::task::spawn_blocking(move || unix::launch(&metadata))
            .await
            .map_err(|e| CoreError::SyncError(format!("Launch task failed: {}", e)))??;
        self.launched().insert(pid);
        Ok(pid)
    }

    fn send_signal(&self, pid: i32, signal: Signal) -> Result<bool> {
        crate::process::unix::send_signal(pid, signal)
    }

    fn reap_exited(&self) -> Result<Vec<ChildExit>> {
        Ok(reap_tracked(
            &mut self.launched(),
            crate::process::unix::try_reap,
        ))
    }

    fn subscribe_exits(&self) -> Result<Box<dyn ExitNotifications>> {
        use tokio::signal::unix::{signal, SignalKind};

        let stream = signal(SignalKind::child()).map_err(|e| {
            CoreError::SyncError(format!("Failed to install SIGCHLD listener: {}", e))
        })?;
        Ok(Box::new(ChildSignalNotifications { stream }))
    }
}

/// Reap every tracked pid that has exited and stop tracking it
///
/// A pid whose reap fails is logged and stays tracked for the next pass.
#[cfg(unix)]
fn reap_tracked(
    launched: &mut HashSet<i32>,
    mut try_reap: impl FnMut(i32) -> Result<Option<ChildExit>>,
) -> Vec<ChildExit> {
    let mut exits = Vec::new();
    for pid in launched.iter().copied() {
        match try_reap(pid) {
            Ok(Some(exit)) => {
                debug!("Reaped child: {}", exit);
                exits.push(exit);
            }
            Ok(None) => {}
            Err(e) => error!("Failed to reap pid {}: {}", pid, e),
        }
    }
    for exit in &exits {
        launched.remove(&exit.pid);
    }
    exits
}

#[cfg(unix)]
struct ChildSignalNotifications {
    stream: tokio::signal::unix::Signal,
}

#[cfg(unix)]
#[async_trait]
impl ExitNotifications for ChildSignalNotifications {
    async fn recv(&mut self) -> Option<()> {
        self.stream.recv().await
    }
}

/// Mock process control for testing
///
/// Launched "processes" stay alive until a test crashes them or the
/// supervisor signals them. SIGINT stops a mock process unless its extension
/// was configured to ignore interrupts; SIGKILL always does. Every signal is
/// recorded.
#[derive(Debug, Clone)]
pub struct MockProcessControl {
    state: Arc<Mutex<MockState>>,
    exited: Arc<Notify>,
}

#[derive(Debug)]
struct MockState {
    next_pid: i32,
    running: HashMap<i32, String>,
    zombies: Vec<ChildExit>,
    launches: Vec<ExtensionMetadata>,
    signals: Vec<(i32, Signal)>,
    failing: HashSet<String>,
    ignoring_interrupt: HashSet<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            next_pid: 10_000,
            running: HashMap::new(),
            zombies: Vec::new(),
            launches: Vec::new(),
            signals: Vec::new(),
            failing: HashSet::new(),
            ignoring_interrupt: HashSet::new(),
        }
    }
}

impl MockProcessControl {
    /// Create a new mock with no failing or stubborn extensions
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            exited: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exit(&self, state: &mut MockState, exit: ChildExit) {
        state.running.remove(&exit.pid);
        state.zombies.push(exit);
        self.exited.notify_one();
    }

    /// Make every launch of `name` fail (or succeed again)
    pub fn set_launch_failure(&self, name: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(name.to_string());
        } else {
            state.failing.remove(name);
        }
    }

    /// Make processes of `name` survive SIGINT
    pub fn ignore_interrupt(&self, name: &str) {
        self.state().ignoring_interrupt.insert(name.to_string());
    }

    /// Terminate a running process with an exit code, as if it crashed
    pub fn crash(&self, pid: i32, code: i32) -> bool {
        let mut state = self.state();
        if !state.running.contains_key(&pid) {
            return false;
        }
        self.exit(&mut state, ChildExit::exited(pid, code));
        true
    }

    /// Whether a pid is still running
    pub fn is_running(&self, pid: i32) -> bool {
        self.state().running.contains_key(&pid)
    }

    /// Number of running processes
    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }

    /// Every successful launch, in order
    pub fn launches(&self) -> Vec<ExtensionMetadata> {
        self.state().launches.clone()
    }

    /// Number of successful launches of `name`
    pub fn launch_count(&self, name: &str) -> usize {
        self.state()
            .launches
            .iter()
            .filter(|md| md.name == name)
            .count()
    }

    /// Every signal sent, in order
    pub fn signals(&self) -> Vec<(i32, Signal)> {
        self.state().signals.clone()
    }

    /// Number of times `signal` was sent to `pid`
    pub fn signal_count(&self, pid: i32, signal: Signal) -> usize {
        self.state()
            .signals
            .iter()
            .filter(|(p, s)| *p == pid && *s == signal)
            .count()
    }
}

impl Default for MockProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for MockProcessControl {
    async fn launch(&self, metadata: &ExtensionMetadata) -> Result<i32> {
        let mut state = self.state();
        if state.failing.contains(&metadata.name) {
            debug!("Mock launch of '{}' fails", metadata.name);
            return Err(CoreError::ProcessSpawn(format!(
                "Failed to exec '{}': No such file or directory (os error 2)",
                metadata.command_line
            )));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.running.insert(pid, metadata.name.clone());
        state.launches.push(metadata.clone());
        debug!("Mock launched '{}' as pid {}", metadata.name, pid);
        Ok(pid)
    }

    fn send_signal(&self, pid: i32, signal: Signal) -> Result<bool> {
        let mut state = self.state();
        state.signals.push((pid, signal));

        let Some(name) = state.running.get(&pid).cloned() else {
            // an unreaped zombie still accepts signals
            return Ok(state.zombies.iter().any(|z| z.pid == pid));
        };
        let stops = match signal {
            Signal::SIGKILL => true,
            Signal::SIGINT => !state.ignoring_interrupt.contains(&name),
            _ => false,
        };
        if stops {
            self.exit(&mut state, ChildExit::signaled(pid, signal as i32));
        }
        Ok(true)
    }

    fn reap_exited(&self) -> Result<Vec<ChildExit>> {
        Ok(std::mem::take(&mut self.state().zombies))
    }

    fn subscribe_exits(&self) -> Result<Box<dyn ExitNotifications>> {
        Ok(Box::new(MockExitNotifications {
            exited: self.exited.clone(),
        }))
    }
}

struct MockExitNotifications {
    exited: Arc<Notify>,
}

#[async_trait]
impl ExitNotifications for MockExitNotifications {
    async fn recv(&mut self) -> Option<()> {
        self.exited.notified().await;
        Some(())
    }
}
