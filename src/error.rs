//! Error types for hilloop
//!
//! Centralized error handling using thiserror. The variants follow the
//! operator-facing taxonomy: configuration problems stop the run at once,
//! device problems may or may not be transient, and reasoning problems never
//! escape the decision panel. An evidence timeout is not an error at all: it
//! is recorded on the transcript and analyzed as a failed attempt.

use thiserror::Error;

/// All error types that can occur in hilloop
#[derive(Debug, Error)]
pub enum HilError {
    /// Missing path or setting, placeholder image in live mode, invalid override
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Flash or serial hardware failure
    #[error("Device error: {reason}")]
    Device { reason: String, transient: bool },

    /// Reasoning backend unreachable or returned unusable output
    #[error("Reasoning unavailable: {0}")]
    ReasoningUnavailable(String),

    /// Firmware build command failed
    #[error("Build failed: {0}")]
    Build(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HilError {
    /// Shorthand for a device error that may clear up on the next attempt.
    pub fn transient_device(reason: impl Into<String>) -> Self {
        HilError::Device {
            reason: reason.into(),
            transient: true,
        }
    }

    /// Shorthand for a device error that ends the run.
    pub fn fatal_device(reason: impl Into<String>) -> Self {
        HilError::Device {
            reason: reason.into(),
            transient: false,
        }
    }

    /// True when the condition may clear on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, HilError::Device { transient: true, .. })
    }

    /// True when the condition must stop the whole run.
    pub fn is_fatal(&self) -> bool {
        match self {
            HilError::Device { transient, .. } => !transient,
            HilError::ReasoningUnavailable(_) => false,
            _ => true,
        }
    }

    /// True for errors the operator has to fix in configuration or inputs.
    pub fn is_configuration(&self) -> bool {
        matches!(self, HilError::Configuration(_) | HilError::Build(_) | HilError::Yaml(_))
    }
}

/// Result type alias for hilloop operations
pub type Result<T> = std::result::Result<T, HilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error() {
        let err = HilError::Configuration("runner.image_path not set".to_string());
        assert_eq!(err.to_string(), "Configuration error: runner.image_path not set");
        assert!(err.is_fatal());
        assert!(err.is_configuration());
    }

    #[test]
    fn test_device_error_transient() {
        let err = HilError::transient_device("port did not reappear");
        assert_eq!(err.to_string(), "Device error: port did not reappear");
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_device_error_fatal() {
        let err = HilError::fatal_device("all flash strategies failed");
        assert!(!err.is_transient());
        assert!(err.is_fatal());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_reasoning_unavailable_is_not_fatal() {
        let err = HilError::ReasoningUnavailable("connection refused".to_string());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Reasoning unavailable: connection refused");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HilError = io_err.into();
        assert!(matches!(err, HilError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: HilError = json_err.into();
        assert!(matches!(err, HilError::Json(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(HilError::Build("exit 2".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
