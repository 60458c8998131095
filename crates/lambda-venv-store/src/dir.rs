//! Filesystem-backed store
//!
//! Keeps artifacts, version records and consumer links under one root
//! directory so several processes can publish against the same store:
//!
//! ```text
//! <root>/artifacts/<location_key>
//! <root>/resources/<resource>/versions/<version>.json
//! <root>/consumers/<consumer_id>.json
//! ```
//!
//! - Atomic writes via write-to-temp-then-rename
//! - Registration is a conditional create under a per-resource file lock
//! - Re-uploading a key replaces the stored bytes

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreOp, StoreResult};
use crate::lock::{StoreLock, DEFAULT_LOCK_TIMEOUT};
use crate::types::{
    paginate, sha256_hex, validate_location_key, ArtifactRef, ResourceKind, VersionPage,
    VersionRecord, FINGERPRINT_TAG,
};
use crate::RemoteStore;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConsumerFile {
    #[serde(default)]
    links: Vec<String>,
}

/// Directory-backed remote store
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
    kind: ResourceKind,
    /// Recorded as `created_by` on registered versions
    principal: Option<String>,
    /// Maximum artifact size in bytes (0 = no limit)
    max_artifact_bytes: u64,
    lock_timeout: Duration,
    /// Lock waits never run past this instant
    deadline: Option<Instant>,
}

impl DirStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>, kind: ResourceKind) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["artifacts", "resources", "consumers", ".tmp"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root,
            kind,
            principal: None,
            max_artifact_bytes: 0,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            deadline: None,
        })
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Reject uploads larger than `max_bytes` (0 = no limit)
    pub fn with_max_artifact_bytes(mut self, max_bytes: u64) -> Self {
        self.max_artifact_bytes = max_bytes;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Stop waiting for locks at `deadline`
    ///
    /// A wait cut short by the deadline fails with
    /// `StoreError::DeadlineExceeded` rather than `LockTimeout`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a consumer with no links
    ///
    /// Returns `false` if the consumer already existed.
    pub fn create_consumer(&self, consumer_id: &str) -> StoreResult<bool> {
        validate_name(consumer_id)?;
        let dir = self.root.join("consumers");
        let _lock = self.lock(&dir, StoreOp::UpdateConsumerLinks)?;
        let path = self.consumer_path(consumer_id);
        if path.exists() {
            return Ok(false);
        }
        self.write_atomic(&path, &serde_json::to_vec_pretty(&ConsumerFile::default())?)?;
        Ok(true)
    }

    /// Path of the stored bytes for `location_key`
    pub fn artifact_path(&self, location_key: &str) -> StoreResult<PathBuf> {
        validate_location_key(location_key)?;
        Ok(self.root.join("artifacts").join(location_key))
    }

    fn lock(&self, dir: &Path, op: StoreOp) -> StoreResult<StoreLock> {
        let Some(deadline) = self.deadline else {
            return StoreLock::acquire(dir, self.lock_timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StoreError::DeadlineExceeded { op });
        }
        if remaining >= self.lock_timeout {
            return StoreLock::acquire(dir, self.lock_timeout);
        }
        StoreLock::acquire(dir, remaining).map_err(|e| match e {
            StoreError::LockTimeout(_) => StoreError::DeadlineExceeded { op },
            other => other,
        })
    }

    fn resource_dir(&self, resource: &str) -> PathBuf {
        self.root.join("resources").join(resource)
    }

    fn consumer_path(&self, consumer_id: &str) -> PathBuf {
        self.root
            .join("consumers")
            .join(format!("{}.json", consumer_id))
    }

    /// All version records of `resource`, ascending by version
    fn read_versions(&self, resource: &str) -> StoreResult<Vec<VersionRecord>> {
        let dir = self.resource_dir(resource).join("versions");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let record: VersionRecord = serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::registry(resource, format!("{}: {}", path.display(), e))
            })?;
            records.push(record);
        }
        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    fn read_consumer(&self, consumer_id: &str) -> StoreResult<ConsumerFile> {
        validate_name(consumer_id)?;
        let path = self.consumer_path(consumer_id);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::registry(consumer_id, format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                resource: consumer_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `bytes` to `path` through a temp file and a rename
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let temp_name = format!(
            ".tmp.{}.{}.{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0),
            TEMP_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let temp_path = self.root.join(".tmp").join(temp_name);

        let result = (|| -> io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&temp_path, path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Resource and consumer names become single path components
fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(())
}

impl RemoteStore for DirStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn list_versions(
        &self,
        resource: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> StoreResult<VersionPage> {
        validate_name(resource)?;
        let records = self.read_versions(resource)?;
        paginate(resource, records, page_token, page_size)
    }

    fn upload_artifact(&self, bytes: &[u8], location_key: &str) -> StoreResult<ArtifactRef> {
        let path = self.artifact_path(location_key)?;
        if self.max_artifact_bytes > 0 && bytes.len() as u64 > self.max_artifact_bytes {
            return Err(StoreError::Quota {
                resource: location_key.to_string(),
                message: format!(
                    "artifact is {} bytes, limit is {}",
                    bytes.len(),
                    self.max_artifact_bytes
                ),
            });
        }

        self.write_atomic(&path, bytes)?;
        debug!(key = location_key, size = bytes.len(), "artifact stored");

        Ok(ArtifactRef {
            location_key: location_key.to_string(),
            sha256: sha256_hex(bytes),
            size: bytes.len() as u64,
        })
    }

    fn register_version(
        &self,
        resource: &str,
        artifact: &ArtifactRef,
        tags: &BTreeMap<String, String>,
    ) -> StoreResult<VersionRecord> {
        validate_name(resource)?;
        if !self.artifact_path(&artifact.location_key)?.exists() {
            return Err(StoreError::NotFound {
                resource: artifact.location_key.clone(),
            });
        }

        let _lock = self.lock(&self.resource_dir(resource), StoreOp::RegisterVersion)?;
        let versions = self.read_versions(resource)?;

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

        let version = versions.last().map(|v| v.version).unwrap_or(0) + 1;
        let record = VersionRecord {
            resource: resource.to_string(),
            kind: self.kind,
            version,
            version_ref: self.kind.version_ref(resource, version),
            created_at: Utc::now(),
            artifact: artifact.clone(),
            tags: tags.clone(),
            created_by: self.principal.clone(),
        };

        let path = self
            .resource_dir(resource)
            .join("versions")
            .join(format!("{:010}.json", version));
        self.write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
        debug!(resource, version, "version registered");

        Ok(record)
    }

    fn consumer_links(&self, consumer_id: &str) -> StoreResult<Vec<String>> {
        Ok(self.read_consumer(consumer_id)?.links)
    }

    fn update_consumer_links(&self, consumer_id: &str, links: &[String]) -> StoreResult<()> {
        let _lock = self.lock(&self.root.join("consumers"), StoreOp::UpdateConsumerLinks)?;
        let mut consumer = self.read_consumer(consumer_id)?;
        consumer.links = links.to_vec();
        self.write_atomic(
            &self.consumer_path(consumer_id),
            &serde_json::to_vec_pretty(&consumer)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tags(fingerprint: &str) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(FINGERPRINT_TAG.to_string(), fingerprint.to_string());
        tags
    }

    #[test]
    fn test_open_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path().join("store"), ResourceKind::Layer).unwrap();
        assert!(store.root().join("artifacts").is_dir());
        assert!(store.root().join("resources").is_dir());
        assert!(store.root().join("consumers").is_dir());
    }

    #[test]
    fn test_upload_writes_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path(), ResourceKind::Layer).unwrap();

        let artifact = store.upload_artifact(b"layer", "deps/abc.tar.gz").unwrap();
        let path = store.artifact_path("deps/abc.tar.gz").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"layer");
        assert_eq!(artifact.size, 5);

        assert!(store.upload_artifact(b"x", "../escape").is_err());
    }

    #[test]
    fn test_register_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path(), ResourceKind::Layer)
            .unwrap()
            .with_principal("tester");

        let artifact = store.upload_artifact(b"x", "deps/x.tar.gz").unwrap();
        let v1 = store
            .register_version("deps", &artifact, &tags("sha256:a"))
            .unwrap();
        let v2 = store
            .register_version("deps", &artifact, &tags("sha256:b"))
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.created_by.as_deref(), Some("tester"));

        let page = store.list_versions("deps", None, 50).unwrap();
        assert_eq!(page.versions.len(), 2);
        assert_eq!(page.versions[1].fingerprint_tag(), Some("sha256:b"));
    }

    #[test]
    fn test_register_conflict_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let first = DirStore::open(temp_dir.path(), ResourceKind::Layer).unwrap();
        let second = DirStore::open(temp_dir.path(), ResourceKind::Layer).unwrap();

        let artifact = first.upload_artifact(b"x", "deps/x.tar.gz").unwrap();
        first
            .register_version("deps", &artifact, &tags("sha256:same"))
            .unwrap();

        let err = second
            .register_version("deps", &artifact, &tags("sha256:same"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { existing_version: 1, .. }));
    }

    #[test]
    fn test_malformed_record_is_registry_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path(), ResourceKind::Layer).unwrap();
        let versions = temp_dir.path().join("resources/deps/versions");
        fs::create_dir_all(&versions).unwrap();
        fs::write(versions.join("0000000001.json"), "{not json").unwrap();

        let err = store.list_versions("deps", None, 50).unwrap_err();
        assert!(matches!(err, StoreError::Registry { .. }));
    }

    #[test]
    fn test_consumers() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path(), ResourceKind::Layer).unwrap();

        assert!(matches!(
            store.consumer_links("func-1"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.create_consumer("func-1").unwrap());
        assert!(!store.create_consumer("func-1").unwrap());

        store
            .update_consumer_links("func-1", &["layer:deps:1".to_string()])
            .unwrap();
        assert_eq!(store.consumer_links("func-1").unwrap(), vec!["layer:deps:1"]);

        assert!(store.create_consumer("../evil").is_err());
    }

    #[test]
    fn test_quota() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirStore::open(temp_dir.path(), ResourceKind::Layer)
            .unwrap()
            .with_max_artifact_bytes(2);
        let err = store.upload_artifact(b"abc", "deps/a.tar.gz").unwrap_err();
        assert!(matches!(err, StoreError::Quota { .. }));
    }
}
