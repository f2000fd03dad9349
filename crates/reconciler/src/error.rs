//! Error types for the reconciler crate.

use thiserror::Error;

use crate::types::ResourceKey;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Every handler failure is one of these. The watch-facing handlers log them
/// and return; nothing here is fatal to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Resource payload or one of its status fields is malformed.
    #[error("failed to decode resource: {reason}")]
    Decode { reason: String },

    /// Canonical serialization of spec or status failed.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// Resource no longer exists in the backing store.
    #[error("resource '{key}' not found")]
    NotFound { key: ResourceKey },

    /// Write rejected because the stored resourceVersion moved.
    #[error("conflict writing '{key}': expected version {expected}, found {actual}")]
    Conflict {
        key: ResourceKey,
        expected: String,
        actual: String,
    },

    /// An update is required but no service instance was ever recorded.
    #[error("resource '{key}' has a parameter hash but no serviceInstanceID")]
    MissingInstanceId { key: ResourceKey },

    /// Executor refused to start an operation.
    #[error("executor failed to start {operation}: {reason}")]
    Executor { operation: String, reason: String },

    /// Executor does not implement the requested operation.
    #[error("executor does not support {operation}")]
    Unsupported { operation: String },

    /// Operation was abandoned because the owning resource was deleted.
    #[error("operation for '{key}' cancelled")]
    Cancelled { key: ResourceKey },

    /// A newer spec took over the resource while the operation was running.
    #[error("operation for '{key}' superseded by a newer spec")]
    Superseded { key: ResourceKey },

    /// Operation did not finish before the configured deadline.
    #[error("operation for '{key}' timed out after {after_secs}s")]
    TimedOut { key: ResourceKey, after_secs: u64 },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(key: &ResourceKey) -> Self {
        Self::NotFound { key: key.clone() }
    }

    /// Create a conflict error.
    pub fn conflict(
        key: &ResourceKey,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            key: key.clone(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an executor error.
    pub fn executor(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Executor {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a superseded error.
    pub fn superseded(key: &ResourceKey) -> Self {
        Self::Superseded { key: key.clone() }
    }

    /// Whether a retry with a fresh read could succeed.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::executor("provision", "image pull failed");
        assert!(err.to_string().contains("provision"));
        assert!(err.to_string().contains("image pull failed"));
    }

    #[test]
    fn test_superseded_names_resource() {
        let err = Error::superseded(&ResourceKey::new("default", "r1"));
        assert!(err.to_string().contains("default/r1"));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_conflict_display_names_both_versions() {
        let key = ResourceKey::new("default", "r1");
        let err = Error::conflict(&key, "3", "4");
        let text = err.to_string();
        assert!(text.contains("default/r1"));
        assert!(text.contains('3'));
        assert!(text.contains('4'));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_not_found_is_not_conflict() {
        let err = Error::not_found(&ResourceKey::new("ns", "gone"));
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("ns/gone"));
    }
}
