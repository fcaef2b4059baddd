//! Error types for DirectPV
//!
//! Every fallible operation in the engine returns [`Error`]. Errors carry a
//! [`ErrorKind`] so that the dispatcher can decide whether to retry and the
//! CSI layer can map them onto gRPC status codes.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the storage engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invariant violated: {0}")]
    Fatal(String),

    #[error("Not implemented: {0}")]
    Unimplemented(String),

    // =========================================================================
    // Orchestrator Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflicting update on {kind}/{name}; object has been modified")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Corrupt data on {device} at offset {offset}: {reason}")]
    Corrupt {
        device: String,
        offset: u64,
        reason: String,
    },

    #[error("No known filesystem or partition table found")]
    FilesystemNotFound,

    #[error("Device busy: {device}")]
    Busy { device: String },

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call {call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: nix::Error,
    },
}

/// Classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    OutOfRange,
    FailedPrecondition,
    InvalidArgument,
    Io,
    Corrupt,
    FilesystemNotFound,
    Busy,
    Timeout,
    Unimplemented,
    Internal,
    Fatal,
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, drop the event
    NoRequeue,
}

impl Error {
    /// Shorthand for a not-found error on a record kind
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Shorthand for a CAS conflict on a record kind
    pub fn conflict(kind: &str, name: impl Into<String>) -> Self {
        Error::Conflict {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Wrap a nix errno with the name of the failing call
    pub fn sys(call: &'static str, source: nix::Error) -> Self {
        Error::Sys { call, source }
    }

    /// Taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::InvalidArgument(_) | Error::Configuration(_) => ErrorKind::InvalidArgument,
            Error::Io(_) | Error::Sys { .. } => ErrorKind::Io,
            Error::Corrupt { .. } => ErrorKind::Corrupt,
            Error::FilesystemNotFound => ErrorKind::FilesystemNotFound,
            Error::Busy { .. } => ErrorKind::Busy,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Unimplemented(_) => ErrorKind::Unimplemented,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Kube(e) => kube_error_kind(e),
            Error::Internal(_) | Error::JsonParse(_) => ErrorKind::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.kind() {
            ErrorKind::Conflict | ErrorKind::Io | ErrorKind::Timeout => {
                ErrorAction::RequeueWithBackoff
            }
            _ if self.is_transient() => ErrorAction::RequeueWithBackoff,
            _ => ErrorAction::NoRequeue,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => {
                true
            }
            Error::Conflict { .. } | Error::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether this is a not-found error, including orchestrator 404s
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Whether this is a CAS conflict, including orchestrator 409s
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

fn kube_error_kind(err: &kube::Error) -> ErrorKind {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => ErrorKind::NotFound,
            409 if resp.reason == "AlreadyExists" => ErrorKind::AlreadyExists,
            409 => ErrorKind::Conflict,
            422 | 400 => ErrorKind::InvalidArgument,
            _ => ErrorKind::Internal,
        },
        kube::Error::HyperError(_) | kube::Error::Service(_) => ErrorKind::Io,
        _ => ErrorKind::Internal,
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::conflict("DirectPVDrive", "node1-abc");
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "eio"));
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Timeout {
            operation: "mount".into(),
            after: Duration::from_secs(300),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::FailedPrecondition("volume is still staged".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Corrupt {
            device: "/dev/sdb".into(),
            offset: 512,
            reason: "bad signature".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::conflict("DirectPVVolume", "pvc-1");
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_kube_status_classification() {
        let api = |code: u16, reason: &str| {
            Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: reason.into(),
                code,
            }))
        };

        assert!(api(404, "NotFound").is_not_found());
        assert!(api(409, "Conflict").is_conflict());
        assert_eq!(api(409, "AlreadyExists").kind(), ErrorKind::AlreadyExists);
        assert!(api(503, "ServiceUnavailable").is_retryable());
        assert!(!api(403, "Forbidden").is_retryable());
    }
}
