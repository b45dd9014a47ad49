//! Unix extension launcher with synchronous exec-failure reporting
//!
//! Extensions are spawned through `std::process::Command`, whose spawn blocks
//! until the child has either exec'd or reported why it could not. A failed
//! child is reaped by the standard library before the error comes back, so
//! callers only ever see pids of running programs.
//!
//! In the child, before exec, the signal mask is cleared and every signal
//! disposition is restored to its default. The daemon may ignore or block
//! signals its extensions must still receive.
//!
//! Reaping is pid-specific ([`try_reap`], [`wait_for_exit`]) so the supervisor
//! never collects children it did not launch. The parent side blocks, so async
//! callers must run [`launch`] on the blocking pool.

// Allow unsafe code for this module since pre_exec requires it
#![allow(unsafe_code)]

use crate::tokenizer::tokenize;
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, kill, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use schema::{ChildExit, ExtensionMetadata, EXTENSION_BODY_ENV};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, warn};

/// Everything needed to exec an extension, resolved before spawning
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    /// Extension name, used for logging only
    pub name: String,
    /// Resolved executable path
    pub program: PathBuf,
    /// Argument vector, `argv[0]` as written in the command line
    pub argv: Vec<String>,
    /// Value for the body environment variable, if any
    pub body: Option<String>,
}

impl LaunchCommand {
    /// Build the launch command for an extension definition
    ///
    /// Tokenizer warnings are logged against the extension name. An empty
    /// argument vector is a configuration error.
    pub fn from_metadata(metadata: &ExtensionMetadata) -> Result<Self> {
        let argv = tokenize(&metadata.command_line).into_args_logged(&metadata.name);
        let argv0 = argv.first().ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "Extension '{}' has no executable in its command line",
                metadata.name
            ))
        })?;
        let program = resolve_program(argv0, &metadata.alternate_location);

        Ok(Self {
            name: metadata.name.clone(),
            program,
            argv,
            body: (!metadata.body.is_empty()).then(|| metadata.body.clone()),
        })
    }

    /// Executable path as a displayable string
    pub fn program_display(&self) -> std::borrow::Cow<'_, str> {
        self.program.to_string_lossy()
    }

    /// The `Command` that execs this extension
    ///
    /// The daemon's environment is inherited minus any stale body variable.
    /// The child starts with an empty signal mask and default dispositions.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some((argv0, args)) = self.argv.split_first() {
            command.arg0(argv0).args(args);
        }
        command.env_remove(EXTENSION_BODY_ENV);
        if let Some(body) = &self.body {
            command.env(EXTENSION_BODY_ENV, body);
        }

        // Safety: sigprocmask() and signal() are async-signal-safe, and
        // restoring SIG_DFL installs no handler code
        #[deny(unsafe_op_in_unsafe_fn)]
        unsafe {
            command.pre_exec(|| {
                sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
                for sig in Signal::iterator() {
                    if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
                        continue;
                    }
                    let _ = signal::signal(sig, SigHandler::SigDfl);
                }
                Ok(())
            });
        }
        command
    }
}

/// Resolve the executable for `argv0`
///
/// With an alternate location the path is `location/argv0`. Otherwise a name
/// containing `/` is used as is and a bare name is looked up in `PATH`. A bare
/// name that cannot be found is returned unchanged and fails at exec time.
pub fn resolve_program(argv0: &str, alternate_location: &str) -> PathBuf {
    if !alternate_location.is_empty() {
        return PathBuf::from(format!("{}/{}", alternate_location, argv0));
    }
    if argv0.contains('/') {
        return PathBuf::from(argv0);
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(argv0))
                .find(|candidate| is_executable(candidate))
        })
        .unwrap_or_else(|| PathBuf::from(argv0))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Launch an extension and return its pid
///
/// Blocks until the child has either exec'd successfully or reported an exec
/// failure. A failed child is already reaped when this returns.
pub fn launch(metadata: &ExtensionMetadata) -> Result<i32> {
    let command = LaunchCommand::from_metadata(metadata)?;
    spawn_command(&command)
}

/// Spawn a prepared command
///
/// The `Child` handle is dropped once its pid is known; reaping is left to
/// [`try_reap`] and [`wait_for_exit`].
pub fn spawn_command(command: &LaunchCommand) -> Result<i32> {
    debug!(
        "Launching extension '{}': {} {:?}",
        command.name,
        command.program_display(),
        command.argv
    );

    let child = command.to_command().spawn().map_err(|e| {
        error!(
            "Failed to exec extension '{}' ({}): {}",
            command.name,
            command.program_display(),
            e
        );
        CoreError::ProcessSpawn(format!(
            "Failed to exec '{}': {}",
            command.program_display(),
            e
        ))
    })?;

    let pid = i32::try_from(child.id()).map_err(|_| {
        CoreError::ProcessSpawn(format!("Extension '{}' got an invalid pid", command.name))
    })?;
    debug!("Extension '{}' running as pid {}", command.name, pid);
    Ok(pid)
}

/// Send a signal to one process
///
/// Returns `Ok(false)` when the process no longer exists (`ESRCH`) or can no
/// longer be signalled by us (`EPERM`, typically a reused pid).
pub fn send_signal(pid: i32, sig: Signal) -> Result<bool> {
    if pid <= 0 {
        return Err(CoreError::ProcessSignal(format!(
            "Refusing to send {} to non-positive pid {}",
            sig, pid
        )));
    }

    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => {
            debug!("Sent {} to pid {}", sig, pid);
            Ok(true)
        }
        Err(Errno::ESRCH) => {
            debug!("Process {} already exited, {} not delivered", pid, sig);
            Ok(false)
        }
        Err(Errno::EPERM) => {
            debug!(
                "Permission denied sending {} to pid {} (likely already exited)",
                sig, pid
            );
            Ok(false)
        }
        Err(e) => {
            error!("Failed to send {} to pid {}: {}", sig, pid, e);
            Err(CoreError::ProcessSignal(format!(
                "Failed to send {} to pid {}: {}",
                sig, pid, e
            )))
        }
    }
}

fn exit_from_status(status: WaitStatus) -> Option<ChildExit> {
    match status {
        WaitStatus::Exited(pid, code) => Some(ChildExit::exited(pid.as_raw(), code)),
        WaitStatus::Signaled(pid, sig, _) => Some(ChildExit::signaled(pid.as_raw(), sig as i32)),
        _ => None,
    }
}

/// Reap one child if it has exited, without blocking
///
/// A pid that is no longer our child (`ECHILD`) is reported as exited with
/// neither a code nor a signal.
pub fn try_reap(pid: i32) -> Result<Option<ChildExit>> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => Ok(exit_from_status(status)),
        Err(Errno::EINTR) => Ok(None),
        Err(Errno::ECHILD) => {
            warn!("Process {} is no longer a child of this process", pid);
            Ok(Some(ChildExit {
                pid,
                exit_code: None,
                signal: None,
            }))
        }
        Err(e) => Err(CoreError::ProcessWait(format!(
            "Failed to reap pid {}: {}",
            pid, e
        ))),
    }
}

/// Block until one child exits
pub fn wait_for_exit(pid: i32) -> Result<ChildExit> {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(status) => {
                if let Some(exit) = exit_from_status(status) {
                    return Ok(exit);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(CoreError::ProcessWait(format!(
                    "Failed to wait for pid {}: {}",
                    pid, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn shell(name: &str, script: &str) -> ExtensionMetadata {
        ExtensionMetadata::new(name, format!("/bin/sh -c \"{}\"", script), "", "")
    }

    #[test]
    fn test_launch_and_wait() {
        let pid = launch(&shell("exit-three", "exit 3")).expect("launch");
        assert!(pid > 0);
        let exit = wait_for_exit(pid).expect("wait");
        assert_eq!(exit, ChildExit::exited(pid, 3));
    }

    #[test]
    fn test_exec_failure_is_reported() {
        let md = ExtensionMetadata::new("missing", "tool --flag", "", "/nonexistent-extension-dir");
        let err = launch(&md).unwrap_err();
        match err {
            CoreError::ProcessSpawn(msg) => {
                assert!(msg.contains("/nonexistent-extension-dir/tool"), "{msg}");
                assert!(msg.contains("No such file or directory"), "{msg}");
            }
            other => panic!("Expected ProcessSpawn, got {other:?}"),
        }
    }

    #[test]
    fn test_non_executable_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("plain.txt");
        fs::write(&script, "not a program").unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&script, perms).unwrap();

        let md = ExtensionMetadata::new(
            "plain",
            "plain.txt",
            "",
            dir.path().to_string_lossy().to_string(),
        );
        let err = launch(&md).unwrap_err();
        assert_eq!(err.code(), "CORE004");
        assert!(err.to_string().contains("Permission denied"), "{err}");
    }

    #[test]
    fn test_empty_command_line_is_rejected() {
        let md = ExtensionMetadata::new("empty", "   ", "", "");
        let err = launch(&md).unwrap_err();
        assert_eq!(err.code(), "CORE001");
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program("tool", "/opt/ext"), PathBuf::from("/opt/ext/tool"));
        assert_eq!(resolve_program("./tool", ""), PathBuf::from("./tool"));
        assert_eq!(resolve_program("/bin/sh", ""), PathBuf::from("/bin/sh"));
        let sh = resolve_program("sh", "");
        assert!(sh.is_absolute(), "sh should resolve through PATH: {sh:?}");
        assert_eq!(
            resolve_program("definitely-not-a-real-program-xyz", ""),
            PathBuf::from("definitely-not-a-real-program-xyz")
        );
    }

    #[test]
    fn test_body_is_exported_only_when_present() {
        let body_entry = |body: &str| {
            let command =
                LaunchCommand::from_metadata(&ExtensionMetadata::new("b", "/bin/true", body, ""))
                    .unwrap()
                    .to_command();
            command
                .get_envs()
                .find(|(key, _)| *key == EXTENSION_BODY_ENV)
                .map(|(_, value)| value.map(|v| v.to_string_lossy().into_owned()))
        };

        assert_eq!(body_entry("payload"), Some(Some("payload".to_string())));
        // an inherited value is removed rather than passed through
        assert_eq!(body_entry(""), Some(None));
    }

    #[test]
    fn test_argv0_is_kept_as_written() {
        let command = LaunchCommand::from_metadata(&ExtensionMetadata::new(
            "located",
            "tool --flag 'two words'",
            "",
            "/opt/ext",
        ))
        .unwrap();
        assert_eq!(command.program, PathBuf::from("/opt/ext/tool"));
        assert_eq!(command.argv, vec!["tool", "--flag", "two words"]);
        assert_eq!(command.to_command().get_program(), "/opt/ext/tool");
    }

    #[test]
    fn test_signal_and_reap() {
        let pid = launch(&shell("sleeper", "exec sleep 30")).expect("launch");
        assert_eq!(try_reap(pid).unwrap(), None);

        assert!(send_signal(pid, Signal::SIGKILL).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        let exit = loop {
            if let Some(exit) = try_reap(pid).unwrap() {
                break exit;
            }
            assert!(Instant::now() < deadline, "child was not reaped in time");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit, ChildExit::signaled(pid, Signal::SIGKILL as i32));
    }

    #[test]
    fn test_signal_rejects_non_positive_pid() {
        assert!(send_signal(0, Signal::SIGINT).is_err());
        assert!(send_signal(-1, Signal::SIGKILL).is_err());
    }
}
