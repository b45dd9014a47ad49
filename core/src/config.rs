//! Configuration loading and validation for supervised extensions
//!
//! This module parses a TOML configuration into `schema::ExtensionMetadata`
//! values plus the supervisor tuning knobs, applies defaults (via serde
//! defaults on schema types), and performs strict validation with field-path
//! error messages.

use crate::tokenizer::tokenize;
use crate::{CoreError, Result};
use schema::{ExtensionMetadata, SupervisorSettings, DAEMON_SHUTDOWN_GRACE_SECS};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Top-level TOML structure for the extensions configuration
///
/// ```toml
/// [supervisor]
/// terminateGraceSecs = 20
///
/// [[extension]]
/// name = "collector"
/// commandLine = "collector --interval 10"
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionsFile {
    /// Supervisor tuning; every field falls back to its default
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Configured extensions, in file order
    #[serde(default)]
    pub extension: Vec<ExtensionMetadata>,
}

impl ExtensionsFile {
    /// Validate the configuration and return `Result<()>` with field-path errors
    pub fn validate(&self) -> Result<()> {
        validate_settings(&self.supervisor)?;

        let mut seen = HashSet::new();
        for (i, ext) in self.extension.iter().enumerate() {
            validate_extension(ext).map_err(|msg| {
                CoreError::ValidationError(format!("extension[{}].{}", i, msg))
            })?;
            if !seen.insert(ext.name.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "extension[{}].name: duplicate name '{}'",
                    i, ext.name
                )));
            }
            for warning in tokenize(&ext.command_line).warnings {
                warn!(
                    "extension[{}].commandLine ('{}'): {}",
                    i, ext.name, warning
                );
            }
        }
        Ok(())
    }
}

/// Longest allowed delay before relaunching a crashed or failed extension
pub const MAX_RETRY_WAIT_SECS: u64 = 3600;

/// Validate supervisor settings
///
/// The whole stop wait (grace plus slack) must fit inside the daemon's own
/// shutdown grace.
pub fn validate_settings(settings: &SupervisorSettings) -> Result<()> {
    if settings.terminate_grace_secs == 0 {
        return Err(CoreError::ValidationError(
            "supervisor.terminateGraceSecs: must be > 0".to_string(),
        ));
    }
    if settings.terminate_grace_secs >= DAEMON_SHUTDOWN_GRACE_SECS {
        return Err(CoreError::ValidationError(format!(
            "supervisor.terminateGraceSecs: must be below the daemon shutdown grace of {}s",
            DAEMON_SHUTDOWN_GRACE_SECS
        )));
    }
    if settings
        .terminate_grace_secs
        .saturating_add(settings.stop_wait_slack_secs)
        >= DAEMON_SHUTDOWN_GRACE_SECS
    {
        return Err(CoreError::ValidationError(format!(
            "supervisor.stopWaitSlackSecs: grace plus slack must be below the daemon shutdown grace of {}s",
            DAEMON_SHUTDOWN_GRACE_SECS
        )));
    }
    if settings.retry_wait_secs > MAX_RETRY_WAIT_SECS {
        return Err(CoreError::ValidationError(format!(
            "supervisor.retryWaitSecs: must be at most {}",
            MAX_RETRY_WAIT_SECS
        )));
    }
    Ok(())
}

/// Check one extension definition. The error is the offending field path
/// relative to the extension entry.
pub fn validate_extension(ext: &ExtensionMetadata) -> std::result::Result<(), String> {
    if ext.name.trim().is_empty() {
        return Err("name: cannot be empty".to_string());
    }
    if ext.command_line.trim().is_empty() {
        return Err("commandLine: cannot be empty".to_string());
    }
    if tokenize(&ext.command_line).args.is_empty() {
        return Err("commandLine: does not contain an executable".to_string());
    }
    Ok(())
}

/// Load extensions from a TOML file path
pub fn load_extensions_from_toml_path(path: impl AsRef<Path>) -> Result<ExtensionsFile> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_extensions_from_toml_str(&data)
}

/// Load extensions from a TOML string
pub fn load_extensions_from_toml_str(input: &str) -> Result<ExtensionsFile> {
    let cfg: ExtensionsFile = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
