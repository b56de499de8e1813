//! Central error types for the GPU device operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the GPU device operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer-related error during cleanup
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Operator configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// DeviceConfig spec validation error
    #[error("DeviceConfig validation error: {0}")]
    ValidationError(String),

    /// More than one distinct owner of the governing kind
    #[error("{object} has multiple {kind} owners: {}", owners.join(", "))]
    AmbiguousOwner {
        kind: String,
        object: String,
        owners: Vec<String>,
    },

    /// Nodes still bound to vfio-pci while the DeviceConfig is being deleted
    #[error("waiting for VFIO unbind on {count} node(s)")]
    CleanupPending { count: usize },

    /// Optimistic-concurrency retry budget used up
    #[error("gave up updating {target} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted { attempts: u32, target: String },
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// The API server rejected a write because the resourceVersion was stale
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::KubeError(kube::Error::Api(e)) if e.code == 409 && e.reason == "Conflict"
        )
    }

    /// The object being created already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::KubeError(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists"
        )
    }

    /// Check if this error type should trigger a fast retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::FinalizerError(_)
                | Error::CleanupPending { .. }
                | Error::ConflictRetriesExhausted { .. }
        )
    }
}

// Implement From for kube::runtime::finalizer::Error to enable ? operator
impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(inner)
            | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(409, "Conflict").is_already_exists());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(!api_error(500, "InternalError").is_not_found());
    }

    #[test]
    fn test_ambiguous_owner_message() {
        let err = Error::AmbiguousOwner {
            kind: "DeviceConfig".to_string(),
            object: "Pod ns/worker-a-n1".to_string(),
            owners: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Pod ns/worker-a-n1 has multiple DeviceConfig owners: a, b"
        );
    }
}
