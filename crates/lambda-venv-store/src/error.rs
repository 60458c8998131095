//! Store error taxonomy

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Store operations, used for error context and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    ListVersions,
    UploadArtifact,
    RegisterVersion,
    ConsumerLinks,
    UpdateConsumerLinks,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::ListVersions => "list_versions",
            StoreOp::UploadArtifact => "upload_artifact",
            StoreOp::RegisterVersion => "register_version",
            StoreOp::ConsumerLinks => "consumer_links",
            StoreOp::UpdateConsumerLinks => "update_consumer_links",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transient failure during {op}: {message}")]
    Transient { op: StoreOp, message: String },

    #[error("{resource} already has version {existing_version} for fingerprint {fingerprint}")]
    Conflict {
        resource: String,
        fingerprint: String,
        existing_version: u64,
    },

    #[error("quota exceeded for {resource}: {message}")]
    Quota { resource: String, message: String },

    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("malformed metadata for {resource}: {message}")]
    Registry { resource: String, message: String },

    #[error("access denied: {message}")]
    Auth { message: String },

    #[error("{op} cancelled")]
    Cancelled { op: StoreOp },

    #[error("{op} exceeded its deadline")]
    DeadlineExceeded { op: StoreOp },

    #[error("invalid location key: {0}")]
    InvalidKey(String),

    #[error("lock timeout after {0:?}")]
    LockTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient { .. } | StoreError::LockTimeout(_))
    }

    /// Build a transient error
    pub fn transient(op: StoreOp, message: impl Into<String>) -> Self {
        StoreError::Transient {
            op,
            message: message.into(),
        }
    }

    /// Build a malformed-metadata error
    pub fn registry(resource: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Registry {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::transient(StoreOp::ListVersions, "throttled").is_retryable());
        assert!(StoreError::LockTimeout(Duration::from_secs(1)).is_retryable());

        assert!(!StoreError::Quota {
            resource: "deps".to_string(),
            message: "too big".to_string(),
        }
        .is_retryable());
        assert!(!StoreError::NotFound {
            resource: "func-1".to_string(),
        }
        .is_retryable());
        assert!(!StoreError::registry("deps", "bad tag").is_retryable());
        assert!(!StoreError::Cancelled {
            op: StoreOp::UploadArtifact
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = StoreError::Conflict {
            resource: "deps".to_string(),
            fingerprint: "sha256:abc".to_string(),
            existing_version: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("deps"));
        assert!(msg.contains("sha256:abc"));
        assert!(msg.contains('3'));

        let err = StoreError::transient(StoreOp::RegisterVersion, "connection reset");
        assert_eq!(
            err.to_string(),
            "transient failure during register_version: connection reset"
        );
    }
}
