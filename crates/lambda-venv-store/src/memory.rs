//! In-memory store
//!
//! Configurable in-process store used by tests. Registration is a
//! conditional create under a mutex, failures can be injected per
//! operation, and every call is counted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::thread;

use chrono::Utc;

use crate::error::{StoreError, StoreOp, StoreResult};
use crate::failure::{FailureConfig, FailureInjector};
use crate::types::{
    paginate, sha256_hex, validate_location_key, ArtifactRef, ResourceKind, VersionPage,
    VersionRecord, FINGERPRINT_TAG,
};
use crate::RemoteStore;

/// Number of calls received per operation, failed ones included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub list_versions: u32,
    pub upload_artifact: u32,
    pub register_version: u32,
    pub consumer_links: u32,
    pub update_consumer_links: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    artifacts: HashMap<String, Vec<u8>>,
    versions: HashMap<String, Vec<VersionRecord>>,
    consumers: HashMap<String, Vec<String>>,
    /// Maximum artifact size in bytes (0 = no limit)
    max_artifact_bytes: u64,
    counts: StoreCallCounts,
}

/// In-process remote store
pub struct MemoryStore {
    kind: ResourceKind,
    state: Mutex<MemoryState>,
    failures: Mutex<FailureInjector>,
    register_barrier: Mutex<Option<Arc<Barrier>>>,
}

impl MemoryStore {
    /// Create an empty store serving `kind`
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MemoryState::default()),
            failures: Mutex::new(FailureInjector::new()),
            register_barrier: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === Test configuration ===

    /// Create a consumer with no links
    pub fn add_consumer(&self, consumer_id: &str) {
        self.add_consumer_with_links(consumer_id, Vec::new());
    }

    /// Create a consumer with pre-existing links
    pub fn add_consumer_with_links(&self, consumer_id: &str, links: Vec<String>) {
        self.state().consumers.insert(consumer_id.to_string(), links);
    }

    /// Reject uploads larger than `max_bytes` (0 = no limit)
    pub fn set_max_artifact_bytes(&self, max_bytes: u64) {
        self.state().max_artifact_bytes = max_bytes;
    }

    /// Inject a failure configuration for an operation
    pub fn inject_failure(&self, op: StoreOp, config: FailureConfig) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inject(op, config);
    }

    /// Clear all injected failures
    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make every `register_version` call wait on `barrier` first
    ///
    /// Lets tests line up concurrent publishers so that all of them have
    /// passed their registry check before any registration lands.
    pub fn sync_registrations(&self, barrier: Arc<Barrier>) {
        *self
            .register_barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(barrier);
    }

    /// Insert a version record verbatim, bypassing all checks
    pub fn seed_version(&self, record: VersionRecord) {
        self.state()
            .versions
            .entry(record.resource.clone())
            .or_default()
            .push(record);
    }

    // === Inspection ===

    /// All versions of `resource`, in registration order
    pub fn versions(&self, resource: &str) -> Vec<VersionRecord> {
        self.state()
            .versions
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Stored bytes under `location_key`
    pub fn artifact(&self, location_key: &str) -> Option<Vec<u8>> {
        self.state().artifacts.get(location_key).cloned()
    }

    /// Number of stored artifacts
    pub fn artifact_count(&self) -> usize {
        self.state().artifacts.len()
    }

    /// Current links of a consumer
    pub fn links(&self, consumer_id: &str) -> Option<Vec<String>> {
        self.state().consumers.get(consumer_id).cloned()
    }

    /// Calls received so far
    pub fn call_counts(&self) -> StoreCallCounts {
        self.state().counts
    }

    // === Internal Helpers ===

    /// Count the call and apply any injected failure
    ///
    /// Returns `Err` for failures that abort the call, `Ok(Some(_))` for
    /// failures to report after the call has been applied.
    fn before(&self, op: StoreOp, resource: &str) -> StoreResult<Option<StoreError>> {
        {
            let mut state = self.state();
            let counts = &mut state.counts;
            match op {
                StoreOp::ListVersions => counts.list_versions += 1,
                StoreOp::UploadArtifact => counts.upload_artifact += 1,
                StoreOp::RegisterVersion => counts.register_version += 1,
                StoreOp::ConsumerLinks => counts.consumer_links += 1,
                StoreOp::UpdateConsumerLinks => counts.update_consumer_links += 1,
            }
        }

        let injected = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check(op)
            .cloned();
        let Some(config) = injected else {
            return Ok(None);
        };

        if let Some(delay) = config.delay {
            thread::sleep(delay);
        }
        match config.failure {
            None => Ok(None),
            Some(failure) if config.commit_before_failing => {
                Ok(Some(failure.to_error(op, resource)))
            }
            Some(failure) => Err(failure.to_error(op, resource)),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(ResourceKind::default())
    }
}

fn finish<T>(value: T, deferred: Option<StoreError>) -> StoreResult<T> {
    match deferred {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

impl RemoteStore for MemoryStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn list_versions(
        &self,
        resource: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> StoreResult<VersionPage> {
        let deferred = self.before(StoreOp::ListVersions, resource)?;
        let mut records = self.versions(resource);
        records.sort_by_key(|r| r.version);
        let page = paginate(resource, records, page_token, page_size)?;
        finish(page, deferred)
    }

    fn upload_artifact(&self, bytes: &[u8], location_key: &str) -> StoreResult<ArtifactRef> {
        let deferred = self.before(StoreOp::UploadArtifact, location_key)?;
        validate_location_key(location_key)?;

        let mut state = self.state();
        let limit = state.max_artifact_bytes;
        if limit > 0 && bytes.len() as u64 > limit {
            return Err(StoreError::Quota {
                resource: location_key.to_string(),
                message: format!("artifact is {} bytes, limit is {}", bytes.len(), limit),
            });
        }

        state
            .artifacts
            .insert(location_key.to_string(), bytes.to_vec());
        let artifact = ArtifactRef {
            location_key: location_key.to_string(),
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
        };
        finish(artifact, deferred)
    }

    fn register_version(
        &self,
        resource: &str,
        artifact: &ArtifactRef,
        tags: &BTreeMap<String, String>,
    ) -> StoreResult<VersionRecord> {
        let deferred = self.before(StoreOp::RegisterVersion, resource)?;

        let barrier = self
            .register_barrier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(barrier) = barrier {
            barrier.wait();
        }

        let mut state = self.state();
        if !state.artifacts.contains_key(&artifact.location_key) {
            return Err(StoreError::NotFound {
                resource: artifact.location_key.clone(),
            });
        }

        let versions = state.versions.entry(resource.to_string()).or_default();
        if let Some(fingerprint) = tags.get(FINGERPRINT_TAG) {
            if let Some(existing) = versions
                .iter()
                .find(|v| v.fingerprint_tag() == Some(fingerprint.as_str()))
            {
                return Err(StoreError::Conflict {
                    resource: resource.to_string(),
                    fingerprint: fingerprint.clone(),
                    existing_version: existing.version,
                });
            }
        }

        let version = versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        let record = VersionRecord {
            resource: resource.to_string(),
            kind: self.kind,
            version,
            version_ref: self.kind.version_ref(resource, version),
            created_at: Utc::now(),
            artifact: artifact.clone(),
            tags: tags.clone(),
            created_by: None,
        };
        versions.push(record.clone());
        finish(record, deferred)
    }

    fn consumer_links(&self, consumer_id: &str) -> StoreResult<Vec<String>> {
        let deferred = self.before(StoreOp::ConsumerLinks, consumer_id)?;
        let links = self
            .links(consumer_id)
            .ok_or_else(|| StoreError::NotFound {
                resource: consumer_id.to_string(),
            })?;
        finish(links, deferred)
    }

    fn update_consumer_links(&self, consumer_id: &str, links: &[String]) -> StoreResult<()> {
        let deferred = self.before(StoreOp::UpdateConsumerLinks, consumer_id)?;
        let mut state = self.state();
        let current = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| StoreError::NotFound {
                resource: consumer_id.to_string(),
            })?;
        *current = links.to_vec();
        finish((), deferred)
    }
}
