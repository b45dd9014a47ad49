#[cfg(test)]
mod tests {
    use crate::{DaemonError, Result};
    use extvisor_core::CoreError;
    use std::error::Error;
    use std::io;

    #[test]
    fn test_daemon_error_display() {
        let err = DaemonError::ConfigError("extension[0].name: cannot be empty".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: extension[0].name: cannot be empty"
        );

        let err = DaemonError::SupervisorError(CoreError::ProcessSignal("no such pid".into()));
        assert!(err.to_string().starts_with("Supervisor error:"));
        assert!(err.to_string().contains("no such pid"));

        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = DaemonError::SignalError(io_err);
        assert!(err.to_string().contains("access denied"));

        let serde_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err = DaemonError::SerializationError(serde_err);
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_daemon_error_from_core() {
        let err: DaemonError = CoreError::ValidationError("bad grace".to_string()).into();
        assert!(matches!(err, DaemonError::ConfigError(ref msg) if msg == "bad grace"));

        let err: DaemonError = CoreError::ConfigurationError("unreadable".to_string()).into();
        assert!(matches!(err, DaemonError::ConfigError(_)));

        let err: DaemonError = CoreError::SyncError("pump".to_string()).into();
        assert!(matches!(err, DaemonError::SupervisorError(CoreError::SyncError(_))));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_daemon_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let daemon_err: DaemonError = io_err.into();

        if let DaemonError::IoError(_) = daemon_err {
            // Expected variant
        } else {
            panic!("Expected DaemonError::IoError variant");
        }
    }

    #[test]
    fn test_daemon_error_from_serde_json() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let daemon_err: DaemonError = serde_err.into();
        assert!(matches!(daemon_err, DaemonError::SerializationError(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u32> {
            Ok(42)
        }

        fn returns_err() -> Result<u32> {
            Err(DaemonError::ConfigError("test failure".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_config_error_has_no_source() {
        let err = DaemonError::ConfigError("test".to_string());
        let _: &dyn Error = &err;
        assert!(err.source().is_none());
    }
}
