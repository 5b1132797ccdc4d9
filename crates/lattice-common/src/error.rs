//! Error types for the Lattice LXC provider
//!
//! Errors carry structured fields (operation names, resource names, HTTP
//! status codes) so callers can classify them without inspecting strings.
//!
//! The controller driving this crate only needs one question answered:
//! should the same call be retried on the next reconcile, or is the failure
//! permanent until the user changes their configuration? That is what
//! [`Error::is_terminal`] answers.

use std::time::Duration;

use thiserror::Error;

use crate::template::TemplateError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status returned by the host API for missing objects
const STATUS_NOT_FOUND: u16 = 404;

/// HTTP status returned by the host API when an object already exists
const STATUS_CONFLICT: u16 = 409;

/// Main error type for Lattice LXC operations
#[derive(Debug, Error)]
pub enum Error {
    /// The host API answered with an error response
    #[error("{operation}: api error ({status}): {message}")]
    Api {
        /// API call that failed (e.g. "GetInstanceState")
        operation: String,
        /// HTTP status code reported by the server
        status: u16,
        /// Error message reported by the server
        message: String,
    },

    /// The request never produced an API response (connect, TLS, IO)
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Where the failure happened (e.g. "connect", "GET /1.0")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A long-running operation reached a failed or cancelled state
    #[error("operation {kind} failed with status {status}: {message}")]
    Operation {
        /// Operation kind (e.g. "CreateInstance", "StopInstance")
        kind: String,
        /// Terminal status reported by the server
        status: String,
        /// Failure payload reported by the server
        message: String,
    },

    /// A deadline elapsed before the call completed
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// The caller cancelled the call
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was in progress
        operation: String,
    },

    /// The server lacks a required extension, driver or feature
    #[error("unsupported: {message}")]
    Unsupported {
        /// Description of the missing capability
        message: String,
        /// Names of the missing extensions, if known
        missing: Vec<String>,
    },

    /// Invalid or incomplete input that cannot succeed without a change
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "loadBalancer.ovn.networkName")
        field: Option<String>,
    },

    /// A remote object exists but belongs to someone else
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// The contested resource (e.g. "network load balancer 10.0.0.10")
        resource: String,
        /// Description of the ownership mismatch
        message: String,
    },

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The payload kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },

    /// Another error annotated with the operation that produced it
    #[error("{context}: {source}")]
    Context {
        /// Operation that failed (e.g. "failed to start instance")
        context: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an API error from a server error response
    pub fn api(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an operation failure error
    pub fn operation(
        kind: impl Into<String>,
        status: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Operation {
            kind: kind.into(),
            status: status.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an unsupported-capability error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
            missing: Vec::new(),
        }
    }

    /// Create an unsupported-capability error listing missing extensions
    pub fn missing_extensions(missing: Vec<String>) -> Self {
        Self::Unsupported {
            message: format!("required extensions {:?} are not supported", missing),
            missing,
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an ownership conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with payload kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Annotate this error with the operation that produced it.
    ///
    /// Cancellation is returned unchanged so callers can match on it.
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            Error::Cancelled { .. } => self,
            source => Error::Context {
                context: context.into(),
                source: Box::new(source),
            },
        }
    }

    /// The innermost error, skipping any context annotations
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is terminal
    ///
    /// Terminal errors cannot succeed on retry without a configuration
    /// change: missing server capabilities, invalid input, and ownership
    /// conflicts. Everything else is transient.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.root(),
            Error::Unsupported { .. } | Error::Validation { .. } | Error::Conflict { .. }
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the host API reported that the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::Api { status, .. } if *status == STATUS_NOT_FOUND)
    }

    /// Check if the host API reported that the object already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Api { status, .. } if *status == STATUS_CONFLICT)
    }

    /// Check if the caller cancelled the call
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled { .. })
    }

    /// Check if a deadline elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Extension trait for annotating results with the failing operation
pub trait ResultExt<T> {
    /// Wrap the error (if any) with the given context
    fn context(self, context: impl Into<String>) -> Result<T, Error>;

    /// Wrap the error (if any) with lazily built context
    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn context(self, context: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T, Error>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Terminal vs transient classification
    // ==========================================================================

    /// Story: a server without the required extensions is a permanent failure
    #[test]
    fn story_missing_extensions_are_terminal() {
        let err = Error::missing_extensions(vec!["instance_oci".to_string()]);
        assert!(err.is_terminal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("instance_oci"));
    }

    /// Story: invalid input and ownership conflicts need a user fix
    #[test]
    fn story_validation_and_conflict_are_terminal() {
        assert!(Error::validation("cannot launch instance without image").is_terminal());
        assert!(
            Error::validation_for_field("loadBalancer.ovn.networkName", "not specified")
                .is_terminal()
        );
        assert!(Error::conflict("network load balancer 10.0.0.10", "foreign labels").is_terminal());
    }

    /// Story: infrastructure hiccups are retried on the next reconcile
    #[test]
    fn story_infrastructure_failures_are_transient() {
        assert!(Error::transport("connect", "connection refused").is_retryable());
        assert!(Error::timeout("StartInstance", Duration::from_secs(5)).is_retryable());
        assert!(Error::operation("CreateInstance", "Failure", "disk full").is_retryable());
        assert!(Error::api("GetInstanceState", 404, "Instance not found").is_retryable());
        assert!(Error::api("GetServer", 500, "boom").is_retryable());
    }

    #[test]
    fn test_context_preserves_classification() {
        let err = Error::validation("no image").context("failed to complete launch spec");
        assert!(err.is_terminal());
        assert!(err.to_string().starts_with("failed to complete launch spec: "));

        let err = Error::api("GetInstanceState", 404, "Instance not found")
            .context("failed to stop instance")
            .context("failed to delete instance");
        assert!(err.is_not_found());
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_cancellation_is_never_wrapped() {
        let err = Error::cancelled("StartInstance").context("failed to start instance");
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_conflict_status_detection() {
        assert!(Error::api("CreateInstance", 409, "Instance already exists").is_conflict());
        assert!(!Error::api("CreateInstance", 400, "bad request").is_conflict());
    }

    #[test]
    fn test_result_ext_with_context() {
        let res: Result<(), Error> = Err(Error::internal("boom"));
        let err = res
            .with_context(|| format!("failed to {}", "reload"))
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to reload: internal error [unknown]: boom");
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("CreateInstance", Duration::from_secs(300));
        assert_eq!(err.to_string(), "CreateInstance timed out after 300s");
    }
}
