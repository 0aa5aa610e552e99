use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to attach debugger: {0}")]
    Attach(String),

    #[error("Page probe failed: {0}")]
    Probe(String),

    #[error("Capture backend error: {0}")]
    CaptureBackend(String),

    #[error("Failed to detach debugger: {0}")]
    Detach(String),

    #[error("No tabId")]
    NoTab,

    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Control channel error: {0}")]
    ControlChannel(String),
}

impl CaptureError {
    /// The single message handed back to a caller in a failure response.
    pub fn user_message(&self) -> String {
        match self {
            CaptureError::NoTab => "No tabId".to_string(),
            CaptureError::Attach(detail) => {
                format!("Could not attach to the tab for capture: {detail}")
            }
            CaptureError::Probe(detail) => format!("Could not measure the page: {detail}"),
            CaptureError::CaptureBackend(detail) => {
                format!("Full page capture failed: {detail}")
            }
            CaptureError::Timeout(after) => {
                format!("Full page capture timed out after {}", crate::format_duration(*after))
            }
            other => other.to_string(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::NoTab => ErrorSeverity::Low,
            CaptureError::Detach(_) => ErrorSeverity::Low,
            CaptureError::Serialization(_) => ErrorSeverity::Low,
            CaptureError::Configuration(_) => ErrorSeverity::Critical,
            CaptureError::CaptureBackend(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::CaptureBackend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_is_descriptive() {
        assert_eq!(CaptureError::NoTab.user_message(), "No tabId");
        assert!(CaptureError::CaptureBackend("boom".to_string())
            .user_message()
            .contains("boom"));
        assert_eq!(
            CaptureError::Timeout(Duration::from_secs(5)).user_message(),
            "Full page capture timed out after 5.0s"
        );
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(CaptureError::NoTab.severity(), ErrorSeverity::Low);
        assert_eq!(
            CaptureError::Configuration("x".to_string()).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            CaptureError::Probe("x".to_string()).severity(),
            ErrorSeverity::Medium
        );
    }
}
