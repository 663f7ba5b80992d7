//! Error taxonomy for the Smyth runtime.
//!
//! Connectors translate backend-specific failures into this taxonomy at the
//! boundary; nothing provider-flavored crosses a connector's public surface.
//! [`Error::AccessDenied`] carries no resource detail so that a denied call
//! cannot be used to probe for resource existence.

use thiserror::Error;

/// A type alias for results produced by the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The candidate does not hold the requested access level on the resource.
    #[error("access denied")]
    AccessDenied,

    #[error("namespace {0} does not exist")]
    NamespaceNotFound(String),

    #[error("datasource {0} not found")]
    DatasourceNotFound(String),

    #[error("vault key {0} not found")]
    VaultKeyMissing(String),

    #[error("storage object {0} not found")]
    StorageObjectMissing(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Writing to an ACL-locked resource without Owner, or re-initializing a
    /// connector with conflicting settings.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport or 5xx failure, surfaced with the connector name and the
    /// underlying message.
    #[error("connector {connector}: backend failure: {message}")]
    Backend { connector: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    /// Referenced connector not registered, missing credentials, malformed
    /// runtime configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The configured backend cannot honor the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// Wraps an underlying backend failure with the connector name.
    pub fn backend(connector: impl Into<String>, err: impl ToString) -> Self {
        Error::Backend {
            connector: connector.into(),
            message: err.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Only backend failures are eligible for retry, and callers must
    /// additionally restrict retries to idempotent operations.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_has_no_detail() {
        let err = Error::AccessDenied;
        assert_eq!(err.to_string(), "access denied");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::backend("RAMVec", "connection reset").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::AccessDenied.is_retryable());
    }
}
