use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while planning or transferring an upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid upload request: {message}")]
    InvalidRequest { message: String },

    #[error("Grant issuer unreachable: {message}")]
    IssuerUnreachable { message: String },

    #[error("Grant issuer rejected the request{}: {message}", status_suffix(.status))]
    IssuerRejected { status: Option<u16>, message: String },

    #[error("Signed URL grant expired after {bytes_sent} bytes")]
    GrantExpired { bytes_sent: u64 },

    #[error("Transfer failed after {attempts} attempt(s), {bytes_sent} bytes sent: {reason}")]
    TransferFailed {
        reason: String,
        attempts: u32,
        bytes_sent: u64,
    },

    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" with status {}", code),
        None => String::new(),
    }
}

/// Serializable discriminant of an [`UploadError`], carried by failure events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidRequest,
    IssuerUnreachable,
    IssuerRejected,
    GrantExpired,
    TransferFailed,
    Configuration,
    Io,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::IssuerUnreachable => "issuer_unreachable",
            Self::IssuerRejected => "issuer_rejected",
            Self::GrantExpired => "grant_expired",
            Self::TransferFailed => "transfer_failed",
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UploadError {
    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an issuer unreachable error
    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        Self::IssuerUnreachable {
            message: message.into(),
        }
    }

    /// Create an issuer rejection, optionally with the HTTP status it answered
    pub fn rejected<S: Into<String>>(status: Option<u16>, message: S) -> Self {
        Self::IssuerRejected {
            status,
            message: message.into(),
        }
    }

    /// Create a transfer failure
    pub fn transfer_failed<S: Into<String>>(reason: S, attempts: u32, bytes_sent: u64) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
            attempts,
            bytes_sent,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest { .. } => FailureKind::InvalidRequest,
            Self::IssuerUnreachable { .. } => FailureKind::IssuerUnreachable,
            Self::IssuerRejected { .. } => FailureKind::IssuerRejected,
            Self::GrantExpired { .. } => FailureKind::GrantExpired,
            Self::TransferFailed { .. } => FailureKind::TransferFailed,
            Self::Configuration { .. } => FailureKind::Configuration,
            Self::Io { .. } => FailureKind::Io,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Bytes confirmed before the failure, kept for diagnostics
    pub fn bytes_sent(&self) -> u64 {
        match self {
            Self::GrantExpired { bytes_sent } => *bytes_sent,
            Self::TransferFailed { bytes_sent, .. } => *bytes_sent,
            _ => 0,
        }
    }

    /// The grant ran out; a fresh plan may succeed
    pub fn is_replannable(&self) -> bool {
        matches!(self, Self::GrantExpired { .. })
    }

    /// The caller may retry the whole pipeline
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IssuerUnreachable { .. } | Self::IssuerRejected { .. } | Self::GrantExpired { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_includes_status() {
        let err = UploadError::rejected(Some(403), "forbidden");
        assert_eq!(
            err.to_string(),
            "Grant issuer rejected the request with status 403: forbidden"
        );

        let err = UploadError::rejected(None, "malformed grant");
        assert_eq!(err.to_string(), "Grant issuer rejected the request: malformed grant");
    }

    #[test]
    fn classification() {
        assert!(!UploadError::invalid("empty").is_retryable());
        assert!(UploadError::unreachable("refused").is_retryable());
        assert!(UploadError::GrantExpired { bytes_sent: 10 }.is_replannable());
        assert!(!UploadError::transfer_failed("reset", 4, 0).is_replannable());
        assert_eq!(UploadError::transfer_failed("reset", 4, 12).bytes_sent(), 12);
        assert_eq!(UploadError::Internal("x".into()).kind(), FailureKind::Internal);
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::GrantExpired).unwrap();
        assert_eq!(json, "\"grant_expired\"");
        assert_eq!(FailureKind::IssuerRejected.to_string(), "issuer_rejected");
    }
}
