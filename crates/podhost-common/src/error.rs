//! Unified error types for the podhost workspace.
//!
//! Every fallible operation in the workspace returns [`PodhostError`]. The
//! variants follow the control-plane status taxonomy so that the service
//! facade can map them onto status codes without inspecting messages.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum PodhostError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A request or configuration value is malformed or inconsistent.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid value.
        message: String,
    },

    /// A referenced sandbox, container, or template does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The operation is valid but the target is not in a state that allows it.
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Description of the unmet precondition.
        message: String,
    },

    /// A security policy denied the operation.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// A bounded wait ran out of time.
    #[error("{operation} did not complete within {timeout:?}")]
    DeadlineExceeded {
        /// Operation that timed out.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// The caller cancelled the operation.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Operation that was cancelled.
        operation: String,
    },

    /// The operation has no defined behavior in this runtime.
    #[error("unsupported operation: {operation}")]
    Unsupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// A backend failed in a way the caller cannot correct.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl PodhostError {
    /// Shorthand for [`PodhostError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for [`PodhostError::FailedPrecondition`].
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Shorthand for [`PodhostError::PermissionDenied`].
    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Shorthand for [`PodhostError::Unsupported`].
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Shorthand for [`PodhostError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the status code this error maps to at the service boundary.
    #[must_use]
    pub const fn code(&self) -> Code {
        match self {
            Self::InvalidArgument { .. } => Code::InvalidArgument,
            Self::NotFound { .. } => Code::NotFound,
            Self::FailedPrecondition { .. } => Code::FailedPrecondition,
            Self::PermissionDenied { .. } => Code::PermissionDenied,
            Self::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            Self::Cancelled { .. } => Code::Cancelled,
            Self::Unsupported { .. } => Code::Unimplemented,
            Self::Io { .. } | Self::Internal { .. } | Self::Serialization { .. } => Code::Internal,
        }
    }
}

/// Status codes surfaced by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// Unknown or removed sandbox, container, or template.
    NotFound,
    /// Malformed configuration or template/clone mismatch.
    InvalidArgument,
    /// Operation attempted before a required step completed.
    FailedPrecondition,
    /// Explicit policy denial.
    PermissionDenied,
    /// A wait or call deadline passed.
    DeadlineExceeded,
    /// The caller cancelled the call.
    Cancelled,
    /// Operation with no defined behavior.
    Unimplemented,
    /// Backend failure.
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::PermissionDenied => "PermissionDenied",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Cancelled => "Canceled",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PodhostError>;
