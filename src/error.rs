use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Need {required} devices, found {found}")]
    InsufficientDevices { found: usize, required: usize },

    #[error("Flashing {device} failed (exit status {status:?}): {stderr_tail}")]
    FlashFailure {
        device: String,
        status: Option<i32>,
        stderr_tail: String,
    },

    #[error("Flashing {device} timed out after {timeout:?}")]
    FlashTimeout { device: String, timeout: Duration },

    #[error("Failed to open {port} for {device}: {reason}")]
    EndpointOpenFailure {
        device: String,
        port: String,
        reason: String,
    },

    #[error("Serial read error for {device}: {source}")]
    TransientReadError {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Test interrupted by user")]
    UserInterrupt,

    #[error("USB serial port error: {0}")]
    UsbError(#[from] tokio_serial::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Log pattern error: {0}")]
    PatternError(#[from] regex::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("JSON encoding error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_devices_message_names_counts() {
        let err = HarnessError::InsufficientDevices { found: 1, required: 2 };
        assert_eq!(err.to_string(), "Need 2 devices, found 1");
    }

    #[test]
    fn flash_timeout_message_names_device() {
        let err = HarnessError::FlashTimeout {
            device: "T-Deck-1".to_string(),
            timeout: Duration::from_secs(300),
        };
        assert!(err.to_string().contains("T-Deck-1"));
        assert!(err.to_string().contains("300s"));
    }

    #[test]
    fn json_failures_convert_to_json_error() {
        let source = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: HarnessError = source.into();
        assert!(matches!(err, HarnessError::JsonError(_)));
        assert!(err.to_string().starts_with("JSON encoding error"));
    }
}
