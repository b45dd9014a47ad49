//! Core functionality for the extension supervisor
//!
//! This crate contains the command-line tokenizer, the fork/exec launcher,
//! the extension registry and the supervisor that reconciles running
//! extensions against their configuration. The daemon crate wires these
//! together with signal handling and configuration reloads.

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod process;
pub mod registry;
pub mod supervisor;
pub mod tokenizer;


// Re-export schema types for convenience
pub use schema::*;

pub use config::{load_extensions_from_toml_path, load_extensions_from_toml_str, ExtensionsFile};
pub use error::{CoreError, Result};
pub use registry::{ExtensionRecord, ExtensionRegistry, KillTimer};
pub use supervisor::{
    ExtensionSupervisor, ProcessControl, ReconcileFailure, ReconcileReport, StopOutcome,
};
pub use tokenizer::{tokenize, TokenizeWarning, Tokenized};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_only_once() {
        // a second global subscriber is refused
        let _ = utils::init_tracing("debug");
        let err = utils::init_tracing("debug").unwrap_err();
        assert_eq!(err.code(), "CORE003");
    }
}
