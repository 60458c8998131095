//! Remote artifact/version store for lambda-venv
//!
//! Defines the capability interface the publishing pipeline talks to
//! (`RemoteStore`) together with the records it exchanges, plus two
//! implementations:
//!
//! - `MemoryStore`: in-process store with failure injection, for tests
//! - `DirStore`: filesystem-backed store, safe to share between processes

mod dir;
mod error;
mod failure;
mod lock;
mod memory;
mod types;

pub use dir::DirStore;
pub use error::{StoreError, StoreOp, StoreResult};
pub use failure::{FailureConfig, FailureInjector, InjectedFailure};
pub use lock::{StoreLock, DEFAULT_LOCK_TIMEOUT};
pub use memory::{MemoryStore, StoreCallCounts};
pub use types::{
    ArtifactRef, ResourceKind, VersionPage, VersionRecord, ARTIFACT_SHA256_TAG, FINGERPRINT_TAG,
    MAX_PAGE_SIZE,
};

use std::collections::BTreeMap;

/// Capability interface of the remote artifact/version store.
///
/// One store instance serves one resource kind. All operations are
/// blocking calls; retries, deadlines and cancellation are applied by the
/// caller.
pub trait RemoteStore: Send + Sync {
    /// Resource kind served by this store
    fn kind(&self) -> ResourceKind;

    /// List one page of published versions, ascending by version number
    fn list_versions(
        &self,
        resource: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> StoreResult<VersionPage>;

    /// Upload artifact bytes under `location_key`
    ///
    /// Uploading to an existing key overwrites it.
    fn upload_artifact(&self, bytes: &[u8], location_key: &str) -> StoreResult<ArtifactRef>;

    /// Register a new version of `resource` pointing at `artifact`
    ///
    /// Registration is conditional on the `FINGERPRINT_TAG` value: if a
    /// version of the resource already carries the same tag value the store
    /// returns `StoreError::Conflict` instead of creating a second version.
    fn register_version(
        &self,
        resource: &str,
        artifact: &ArtifactRef,
        tags: &BTreeMap<String, String>,
    ) -> StoreResult<VersionRecord>;

    /// Current version references attached to a consumer
    fn consumer_links(&self, consumer_id: &str) -> StoreResult<Vec<String>>;

    /// Replace the version references attached to a consumer
    fn update_consumer_links(&self, consumer_id: &str, links: &[String]) -> StoreResult<()>;
}
