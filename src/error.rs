use thiserror::Error;

/// Errors that can occur when talking to a hydration coaster
#[derive(Error, Debug)]
pub enum CoasterError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Coaster device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The characteristic rejected the requested write mode
    #[error("Write mode not supported by characteristic: {0}")]
    WriteNotSupported(String),

    /// Writing a command to the device failed
    #[error("Failed to write command: {0}")]
    Write(String),

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device answered a command with an `ERR` line
    #[error("Device error: {message}")]
    DeviceError {
        /// Message carried by the `ERR` line
        message: String,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current invalid state description
        state: String,
    },

    /// Line parsing failed
    #[error("Failed to parse line: {0}")]
    ParseError(String),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for coaster operations
pub type Result<T> = std::result::Result<T, CoasterError>;

impl CoasterError {
    /// Check if the reconnect policy may retry after this error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = CoasterError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_retryable());
        assert!(CoasterError::Timeout { timeout_ms: 10 }.is_retryable());

        let write_error = CoasterError::Write("gatt 0x0e".to_string());
        assert!(!write_error.is_retryable());

        let device_error = CoasterError::DeviceError {
            message: "bad goal".to_string(),
        };
        assert!(!device_error.is_retryable());
        assert_eq!(device_error.to_string(), "Device error: bad goal");

        let parse_error = CoasterError::ParseError("DL x".to_string());
        assert!(!parse_error.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let error = CoasterError::InvalidParameters("goal out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("goal out of range"));

        let timeout = CoasterError::Timeout { timeout_ms: 5000 };
        assert_eq!(timeout.to_string(), "Operation timed out after 5000ms");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let error: CoasterError = json_err.into();
        assert!(matches!(error, CoasterError::Json(_)));
    }
}
