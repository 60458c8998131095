//! Failure injection for the in-memory store
//!
//! Supports configurable failure injection for testing error paths.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{StoreError, StoreOp};

/// Kind of error an injected failure produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Network fault or throttling (retryable)
    Transient,
    /// Size or count limit rejection
    Quota,
    /// Target resource does not exist
    NotFound,
    /// Credentials rejected
    Auth,
}

impl InjectedFailure {
    /// Build the store error for this failure
    pub fn to_error(self, op: StoreOp, resource: &str) -> StoreError {
        match self {
            InjectedFailure::Transient => StoreError::transient(op, "injected: throttled"),
            InjectedFailure::Quota => StoreError::Quota {
                resource: resource.to_string(),
                message: "injected: limit reached".to_string(),
            },
            InjectedFailure::NotFound => StoreError::NotFound {
                resource: resource.to_string(),
            },
            InjectedFailure::Auth => StoreError::Auth {
                message: format!("injected: {} denied for {}", op, resource),
            },
        }
    }
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Error to return (if any)
    pub failure: Option<InjectedFailure>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
    /// Apply the operation before returning the error (lost response)
    pub commit_before_failing: bool,
}

impl FailureConfig {
    /// Create a config that returns an error
    pub fn error(failure: InjectedFailure) -> Self {
        Self {
            failure: Some(failure),
            delay: None,
            fail_count: None,
            commit_before_failing: false,
        }
    }

    /// Create a transient error config
    pub fn transient() -> Self {
        Self::error(InjectedFailure::Transient)
    }

    /// Create a config that just adds delay
    pub fn delay(duration: Duration) -> Self {
        Self {
            failure: None,
            delay: Some(duration),
            fail_count: None,
            commit_before_failing: false,
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    /// Perform the operation, then report the failure anyway
    pub fn after_commit(mut self) -> Self {
        self.commit_before_failing = true;
        self
    }
}

/// Failure injector for the in-memory store
#[derive(Debug, Default)]
pub struct FailureInjector {
    /// Per-operation failure configs
    configs: HashMap<StoreOp, FailureConfig>,
    /// Call counts per operation (for fail_count tracking)
    call_counts: HashMap<StoreOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation
    pub fn inject(&mut self, op: StoreOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    /// Clear all failure injections
    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    /// Clear failure injection for a specific operation
    pub fn clear_op(&mut self, op: StoreOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Check if a failure should occur for an operation
    ///
    /// Returns the failure config if one should occur, None otherwise.
    pub fn check(&mut self, op: StoreOp) -> Option<&FailureConfig> {
        let config = self.configs.get(&op)?;
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }

        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_injector_basic() {
        let mut injector = FailureInjector::new();

        assert!(injector.check(StoreOp::ListVersions).is_none());

        injector.inject(
            StoreOp::UploadArtifact,
            FailureConfig::error(InjectedFailure::Quota),
        );

        let config = injector.check(StoreOp::UploadArtifact).unwrap();
        assert_eq!(config.failure, Some(InjectedFailure::Quota));
        assert!(injector.check(StoreOp::RegisterVersion).is_none());
    }

    #[test]
    fn test_failure_injector_fail_count() {
        let mut injector = FailureInjector::new();

        // Fail twice, then succeed
        injector.inject(
            StoreOp::RegisterVersion,
            FailureConfig::transient().with_fail_count(2),
        );

        assert!(injector.check(StoreOp::RegisterVersion).is_some());
        assert!(injector.check(StoreOp::RegisterVersion).is_some());
        assert!(injector.check(StoreOp::RegisterVersion).is_none());
        assert!(injector.check(StoreOp::RegisterVersion).is_none());
    }

    #[test]
    fn test_failure_injector_clear() {
        let mut injector = FailureInjector::new();

        injector.inject(StoreOp::ConsumerLinks, FailureConfig::transient());
        injector.inject(StoreOp::ListVersions, FailureConfig::transient());
        assert!(injector.check(StoreOp::ConsumerLinks).is_some());

        injector.clear_op(StoreOp::ConsumerLinks);
        assert!(injector.check(StoreOp::ConsumerLinks).is_none());
        assert!(injector.check(StoreOp::ListVersions).is_some());

        injector.clear();
        assert!(injector.check(StoreOp::ListVersions).is_none());
    }

    #[test]
    fn test_injected_failure_errors() {
        let err = InjectedFailure::Transient.to_error(StoreOp::ListVersions, "deps");
        assert!(err.is_retryable());

        let err = InjectedFailure::NotFound.to_error(StoreOp::ConsumerLinks, "func-9");
        assert!(matches!(err, StoreError::NotFound { ref resource } if resource == "func-9"));

        let err = InjectedFailure::Auth.to_error(StoreOp::RegisterVersion, "deps");
        assert!(matches!(err, StoreError::Auth { .. }));
    }

    #[test]
    fn test_after_commit_flag() {
        let config = FailureConfig::transient().after_commit().with_fail_count(1);
        assert!(config.commit_before_failing);
        assert_eq!(config.fail_count, Some(1));
    }
}
