//! Daemon library for the extension supervisor
//!
//! Owns the extension configuration file and the supervisor. Configuration
//! changes arrive through `SIGHUP`; `SIGINT`, `SIGTERM` and `SIGQUIT` stop
//! every extension before the daemon exits.

#![allow(unused_crate_dependencies)]

pub mod simple_error;

#[cfg(test)]
mod simple_error_tests;

use extvisor_core::{
    load_extensions_from_toml_path, ExtensionMetadata, ExtensionSupervisor, ExtensionsFile,
    SupervisorSettings, DAEMON_SHUTDOWN_GRACE_SECS,
};
pub use simple_error::{DaemonError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// What the signal loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Re-read the configuration file and reconcile
    Reload,
    /// Log the status of every extension
    DumpStatus,
    /// Stop every extension and exit
    Shutdown,
}

/// Unix signal listeners feeding the daemon loop
#[cfg(unix)]
#[derive(Debug)]
pub struct DaemonSignals {
    hangup: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl DaemonSignals {
    /// Install the listeners
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let listen = |kind| signal(kind).map_err(DaemonError::SignalError);
        Ok(Self {
            hangup: listen(SignalKind::hangup())?,
            user1: listen(SignalKind::user_defined1())?,
            interrupt: listen(SignalKind::interrupt())?,
            terminate: listen(SignalKind::terminate())?,
            quit: listen(SignalKind::quit())?,
        })
    }

    /// Wait for the next signal the daemon cares about
    pub async fn next(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.hangup.recv() => DaemonSignal::Reload,
            _ = self.user1.recv() => DaemonSignal::DumpStatus,
            _ = self.interrupt.recv() => DaemonSignal::Shutdown,
            _ = self.terminate.recv() => DaemonSignal::Shutdown,
            _ = self.quit.recv() => DaemonSignal::Shutdown,
        }
    }
}

/// The extension supervision daemon
#[derive(Debug, Clone)]
pub struct Daemon {
    config_path: Option<PathBuf>,
    supervisor: ExtensionSupervisor,
}

impl Daemon {
    /// Create a daemon that launches real processes
    ///
    /// Supervisor settings are read from the configuration file once; later
    /// reloads only change the extension list.
    ///
    /// # Errors
    /// Returns an error if the configuration file is invalid.
    #[cfg(unix)]
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let settings = match &config_path {
            Some(path) => load_config(path)?.supervisor,
            None => SupervisorSettings::default(),
        };
        let supervisor = ExtensionSupervisor::with_unix_control(settings)?;
        Ok(Self::with_supervisor(config_path, supervisor))
    }

    /// Create a daemon around an existing supervisor
    #[must_use]
    pub fn with_supervisor(config_path: Option<PathBuf>, supervisor: ExtensionSupervisor) -> Self {
        Self {
            config_path,
            supervisor,
        }
    }

    /// The supervisor driven by this daemon
    pub fn supervisor(&self) -> &ExtensionSupervisor {
        &self.supervisor
    }

    /// Read the configured extensions; no configuration file means none
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or fails validation.
    pub fn load_extensions(&self) -> Result<Vec<ExtensionMetadata>> {
        let Some(path) = &self.config_path else {
            return Ok(Vec::new());
        };
        let file = load_config(path)?;
        if &file.supervisor != self.supervisor.settings() {
            warn!(
                "Supervisor settings in {} changed; they apply after a restart",
                path.display()
            );
        }
        Ok(file.extension)
    }

    /// Load the configuration and reconcile in the background
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid. Running extensions
    /// are left untouched in that case.
    pub fn reload(&self) -> Result<usize> {
        let extensions = self.load_extensions()?;
        let count = extensions.len();
        info!("Loaded {} extension definition(s)", count);
        self.supervisor.start_extensions_async(extensions);
        Ok(count)
    }

    /// Serialize the status of every extension
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn status_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.supervisor.status())?)
    }

    /// Stop every extension, bounded by the daemon shutdown grace
    ///
    /// Returns true when every extension exited in time.
    pub async fn shutdown(&self) -> bool {
        let grace = Duration::from_secs(DAEMON_SHUTDOWN_GRACE_SECS);
        let stopped =
            match tokio::time::timeout(grace, self.supervisor.stop_all_extensions()).await {
                Ok(stopped) => stopped,
                Err(_) => {
                    error!("Extensions did not stop within {:?}", grace);
                    false
                }
            };
        self.supervisor.shutdown();
        stopped
    }

    /// Handle one signal; returns false when the loop should exit
    pub async fn handle_signal(&self, signal: DaemonSignal) -> bool {
        match signal {
            DaemonSignal::Reload => {
                info!("Received SIGHUP, reloading extension configuration");
                if let Err(e) = self.reload() {
                    error!("Ignoring configuration reload: {}", e);
                }
                true
            }
            DaemonSignal::DumpStatus => {
                match self.status_json() {
                    Ok(json) => info!("Extension status:\n{}", json),
                    Err(e) => error!("Failed to render extension status: {}", e),
                }
                true
            }
            DaemonSignal::Shutdown => {
                info!("Shutdown requested, stopping extensions");
                if !self.shutdown().await {
                    warn!("Some extensions were still running at shutdown");
                }
                false
            }
        }
    }

    /// Start the configured extensions and serve signals until shutdown
    ///
    /// # Errors
    /// Returns an error if the initial configuration is invalid or the
    /// signal listeners cannot be installed.
    #[cfg(unix)]
    pub async fn run(&self) -> Result<()> {
        let mut signals = DaemonSignals::install()?;
        self.reload()?;
        info!("Daemon running (pid {})", std::process::id());

        while self.handle_signal(signals.next().await).await {}

        info!("Daemon stopped");
        Ok(())
    }
}

fn load_config(path: &Path) -> Result<ExtensionsFile> {
    load_extensions_from_toml_path(path).map_err(|e| {
        DaemonError::ConfigError(format!("{}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use extvisor_core::supervisor::MockProcessControl;
    use std::sync::Arc;

    fn mock_daemon(config: &str) -> (Daemon, MockProcessControl, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), config).unwrap();
        let control = MockProcessControl::new();
        let settings = SupervisorSettings {
            terminate_grace_secs: 1,
            ..SupervisorSettings::default()
        };
        let supervisor = ExtensionSupervisor::new(Arc::new(control.clone()), settings).unwrap();
        let daemon = Daemon::with_supervisor(Some(file.path().to_path_buf()), supervisor);
        (daemon, control, file)
    }

    const TWO_EXTENSIONS: &str = r#"
[[extension]]
name = "alpha"
commandLine = "alpha --serve"

[[extension]]
name = "beta"
commandLine = "beta"
body = "{}"
"#;

    #[tokio::test]
    async fn test_reload_starts_configured_extensions() {
        let (daemon, control, _file) = mock_daemon(TWO_EXTENSIONS);
        assert_eq!(daemon.reload().unwrap(), 2);
        let report = daemon.supervisor().settle().await.unwrap();
        assert_eq!(report.started, vec!["alpha", "beta"]);
        assert_eq!(control.running_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_running_extensions() {
        let (daemon, control, file) = mock_daemon(TWO_EXTENSIONS);
        daemon.reload().unwrap();
        daemon.supervisor().settle().await.unwrap();

        std::fs::write(file.path(), "[[extension]]\nname = \"\"\ncommandLine = \"x\"\n").unwrap();
        assert!(daemon.handle_signal(DaemonSignal::Reload).await);
        assert!(daemon.supervisor().settle().await.is_none());
        assert_eq!(daemon.supervisor().status().len(), 2);
        assert!(control.signals().is_empty());
    }

    #[tokio::test]
    async fn test_no_config_file_means_no_extensions() {
        let control = MockProcessControl::new();
        let supervisor =
            ExtensionSupervisor::new(Arc::new(control.clone()), SupervisorSettings::default())
                .unwrap();
        let daemon = Daemon::with_supervisor(None, supervisor);
        assert_eq!(daemon.reload().unwrap(), 0);
        assert!(daemon.supervisor().settle().await.is_none());
    }

    #[tokio::test]
    async fn test_status_json_lists_extensions() {
        let (daemon, _control, _file) = mock_daemon(TWO_EXTENSIONS);
        daemon.reload().unwrap();
        daemon.supervisor().settle().await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&daemon.status_json().unwrap()).unwrap();
        let entries = json.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["status"], "NORMAL");
        assert!(daemon.handle_signal(DaemonSignal::DumpStatus).await);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_everything() {
        let (daemon, control, _file) = mock_daemon(TWO_EXTENSIONS);
        daemon.reload().unwrap();
        daemon.supervisor().settle().await.unwrap();

        assert!(!daemon.handle_signal(DaemonSignal::Shutdown).await);
        assert_eq!(control.running_count(), 0);
        assert!(daemon.supervisor().status().is_empty());
    }
}
