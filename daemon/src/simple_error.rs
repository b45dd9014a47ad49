//! Simple daemon error types

use extvisor_core::CoreError;

#[derive(Debug)]
pub enum DaemonError {
    ConfigError(String),
    SupervisorError(CoreError),
    SignalError(std::io::Error),
    IoError(std::io::Error),
    SerializationError(serde_json::Error),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            DaemonError::SupervisorError(err) => write!(f, "Supervisor error: {}", err),
            DaemonError::SignalError(err) => write!(f, "Signal handling error: {}", err),
            DaemonError::IoError(err) => write!(f, "I/O error: {}", err),
            DaemonError::SerializationError(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::ConfigError(_) => None,
            DaemonError::SupervisorError(err) => Some(err),
            DaemonError::SignalError(err) | DaemonError::IoError(err) => Some(err),
            DaemonError::SerializationError(err) => Some(err),
        }
    }
}

impl From<CoreError> for DaemonError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConfigurationError(msg) | CoreError::ValidationError(msg) => {
                DaemonError::ConfigError(msg)
            }
            other => DaemonError::SupervisorError(other),
        }
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::IoError(err)
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::SerializationError(err)
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
