//! Thread-safe registry of supervised extensions
//!
//! The registry owns every live [`ExtensionRecord`]. Records are indexed by
//! name (authoritative) and by pid. Both indices live behind one lock so they
//! never disagree. A second, independent lock guards the pending-exit set:
//! pids whose stop was confirmed by exit handling and that reconciliation has
//! not collected yet.
//!
//! No lock is ever held across an await point. Records removed from the
//! registry are dropped after the lock is released, which cancels their
//! force-kill timers.

use crate::{CoreError, Result};
use schema::{format_timestamp, ExtensionMetadata, ExtensionSnapshot, ExtensionStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Pending SIGKILL for a stopping extension
///
/// Dropping the timer sets its cancellation flag and aborts the task. The task
/// itself checks the flag before acting, so a timer that already woke up does
/// nothing once cancelled.
#[derive(Debug)]
pub struct KillTimer {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl KillTimer {
    /// Wrap a spawned timer task and the flag it checks
    pub fn new(cancelled: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self { cancelled, task }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.task.abort();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for KillTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runtime state of one supervised extension
#[derive(Debug)]
pub struct ExtensionRecord {
    /// Definition the current process was launched with
    pub metadata: ExtensionMetadata,
    /// Current (or, while `Bad`, last) process id
    pub pid: i32,
    /// Monotonic launch time, for crash-window decisions
    pub start_time: Instant,
    /// Wall-clock launch time, for reporting
    pub started_at: SystemTime,
    /// Crashes counted since the last stable run
    pub retry_count: u32,
    /// Current status
    pub status: ExtensionStatus,
    kill_timer: Option<KillTimer>,
}

impl ExtensionRecord {
    /// Record for a freshly launched process
    pub fn new(metadata: ExtensionMetadata, pid: i32) -> Self {
        Self {
            metadata,
            pid,
            start_time: Instant::now(),
            started_at: SystemTime::now(),
            retry_count: 0,
            status: ExtensionStatus::Normal,
            kill_timer: None,
        }
    }

    /// Extension name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Time since the current process was launched
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Reset launch bookkeeping after a relaunch. The pid itself is changed
    /// through [`ExtensionRegistry::update_pid`].
    pub fn mark_relaunched(&mut self) {
        self.start_time = Instant::now();
        self.started_at = SystemTime::now();
        self.status = ExtensionStatus::Normal;
    }

    /// Attach a force-kill timer. Returns false (and cancels `timer`) when one
    /// is already armed.
    pub fn arm_kill_timer(&mut self, timer: KillTimer) -> bool {
        if self.kill_timer.is_some() {
            timer.cancel();
            return false;
        }
        self.kill_timer = Some(timer);
        true
    }

    /// Whether a force-kill timer is armed
    pub fn has_kill_timer(&self) -> bool {
        self.kill_timer.is_some()
    }

    /// Serializable view
    pub fn snapshot(&self) -> ExtensionSnapshot {
        ExtensionSnapshot {
            metadata: self.metadata.clone(),
            pid: self.pid,
            status: self.status,
            retry_count: self.retry_count,
            started_at: format_timestamp(self.started_at),
        }
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_name: BTreeMap<String, ExtensionRecord>,
    by_pid: HashMap<i32, String>,
}

impl Indices {
    /// Remove `pid -> name` only if it still points at `name`
    fn unmap_pid(&mut self, pid: i32, name: &str) {
        if self.by_pid.get(&pid).map(String::as_str) == Some(name) {
            self.by_pid.remove(&pid);
        }
    }

    /// Point `pid` at `name`, purging a stale mapping held by another record
    fn map_pid(&mut self, pid: i32, name: &str) {
        if let Some(previous) = self.by_pid.insert(pid, name.to_string()) {
            if previous != name {
                warn!(
                    "pid {} moved from extension '{}' to '{}', purging stale mapping",
                    pid, previous, name
                );
            }
        }
    }

    fn record_for_pid_mut(&mut self, pid: i32) -> Option<&mut ExtensionRecord> {
        let name = self.by_pid.get(&pid)?;
        self.by_name
            .get_mut(name)
            .filter(|record| record.pid == pid)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        error!("Extension registry called with an empty name");
        return Err(CoreError::RegistryError(
            "extension name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_pid(pid: i32) -> Result<()> {
    if pid <= 0 {
        error!("Extension registry called with invalid pid {}", pid);
        return Err(CoreError::RegistryError(format!("invalid pid {}", pid)));
    }
    Ok(())
}

/// Registry of supervised extensions
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    indices: Mutex<Indices>,
    pending_exits: Mutex<HashSet<i32>>,
}

impl ExtensionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn indices(&self) -> MutexGuard<'_, Indices> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<i32>> {
        self.pending_exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record, replacing any record with the same name
    ///
    /// The replaced record is dropped (and its kill timer cancelled) before
    /// this returns.
    pub fn add(&self, record: ExtensionRecord) -> Result<()> {
        validate_name(record.name())?;
        validate_pid(record.pid)?;

        let name = record.name().to_string();
        let pid = record.pid;
        let replaced = {
            let mut indices = self.indices();
            let replaced = indices.by_name.insert(name.clone(), record);
            if let Some(old) = &replaced {
                indices.unmap_pid(old.pid, &name);
            }
            indices.map_pid(pid, &name);
            replaced
        };

        if let Some(old) = replaced {
            debug!(
                "Replaced extension '{}' record (pid {} -> {})",
                name, old.pid, pid
            );
        } else {
            debug!("Registered extension '{}' with pid {}", name, pid);
        }
        Ok(())
    }

    /// Snapshot of the record with the given name
    pub fn get(&self, name: &str) -> Option<ExtensionSnapshot> {
        if validate_name(name).is_err() {
            return None;
        }
        self.indices().by_name.get(name).map(ExtensionRecord::snapshot)
    }

    /// Snapshot of the record currently owning `pid`
    pub fn get_by_pid(&self, pid: i32) -> Option<ExtensionSnapshot> {
        if validate_pid(pid).is_err() {
            return None;
        }
        self.indices()
            .record_for_pid_mut(pid)
            .map(|record| record.snapshot())
    }

    /// Move extension `name` from `old_pid` to `new_pid`
    ///
    /// Keyed by name as well as pid: while an extension waits for a relaunch
    /// its old pid may already belong to another extension.
    pub fn update_pid(&self, name: &str, old_pid: i32, new_pid: i32) -> Result<()> {
        validate_name(name)?;
        validate_pid(old_pid)?;
        validate_pid(new_pid)?;

        let mut indices = self.indices();
        let record = indices.by_name.get_mut(name).ok_or_else(|| {
            CoreError::RegistryError(format!("no extension named '{}'", name))
        })?;
        if record.pid != old_pid {
            return Err(CoreError::RegistryError(format!(
                "extension '{}' has pid {}, not {}",
                name, record.pid, old_pid
            )));
        }
        record.pid = new_pid;
        indices.unmap_pid(old_pid, name);
        indices.map_pid(new_pid, name);
        debug!("Extension '{}' pid {} -> {}", name, old_pid, new_pid);
        Ok(())
    }

    /// Remove one record from both indices
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let removed = {
            let mut indices = self.indices();
            let removed = indices.by_name.remove(name);
            if let Some(record) = &removed {
                indices.unmap_pid(record.pid, name);
            }
            removed
        };
        match removed {
            Some(record) => {
                debug!("Removed extension '{}' (pid {})", name, record.pid);
                Ok(())
            }
            None => Err(CoreError::RegistryError(format!(
                "no extension named '{}'",
                name
            ))),
        }
    }

    /// Remove several records. Missing names make the call fail after the
    /// rest were removed.
    pub fn delete_many<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let missing: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| self.delete(name).is_err())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::RegistryError(format!(
                "failed to remove extension(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Remove every record, returning how many there were
    pub fn delete_all(&self) -> usize {
        let removed = {
            let mut indices = self.indices();
            indices.by_pid.clear();
            std::mem::take(&mut indices.by_name)
        };
        removed.len()
    }

    /// Visit a snapshot of every record in name order
    ///
    /// The lock is released before the visitor runs, so it may call back into
    /// the registry.
    pub fn for_each(&self, mut visitor: impl FnMut(&ExtensionSnapshot)) {
        for snapshot in self.snapshots() {
            visitor(&snapshot);
        }
    }

    /// Mutate the record with the given name
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut ExtensionRecord) -> R) -> Option<R> {
        if validate_name(name).is_err() {
            return None;
        }
        self.indices().by_name.get_mut(name).map(f)
    }

    /// Mutate the record currently owning `pid`
    pub fn update_by_pid<R>(
        &self,
        pid: i32,
        f: impl FnOnce(&mut ExtensionRecord) -> R,
    ) -> Option<R> {
        if validate_pid(pid).is_err() {
            return None;
        }
        self.indices().record_for_pid_mut(pid).map(f)
    }

    /// Names of all records, sorted
    pub fn names(&self) -> Vec<String> {
        self.indices().by_name.keys().cloned().collect()
    }

    /// Snapshots of all records, sorted by name
    pub fn snapshots(&self) -> Vec<ExtensionSnapshot> {
        self.indices()
            .by_name
            .values()
            .map(ExtensionRecord::snapshot)
            .collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.indices().by_name.len()
    }

    /// Whether the registry holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember that `pid` finished stopping
    pub fn record_pending_exit(&self, pid: i32) -> bool {
        if validate_pid(pid).is_err() {
            return false;
        }
        if !self.pending().insert(pid) {
            error!("pid {} was already pending exit collection", pid);
            return false;
        }
        true
    }

    /// Take every pending pid, leaving the set empty
    pub fn drain_pending_exits(&self) -> HashSet<i32> {
        std::mem::take(&mut *self.pending())
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let indices = self.indices();
        for (pid, name) in &indices.by_pid {
            let record = indices
                .by_name
                .get(name)
                .unwrap_or_else(|| panic!("pid {pid} maps to missing '{name}'"));
            assert_eq!(record.pid, *pid, "pid index out of sync for '{name}'");
        }
        for (name, record) in &indices.by_name {
            assert_eq!(record.name(), name);
        }
    }
}
