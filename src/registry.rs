//! Version registry
//!
//! Read side of the remote store: enumerates the published versions of a
//! resource and finds the one built from a given fingerprint. Metadata
//! only; artifacts are never downloaded.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use lambda_venv_store::{
    ArtifactRef, RemoteStore, ResourceKind, StoreError, StoreOp, StoreResult, VersionRecord,
    FINGERPRINT_TAG, MAX_PAGE_SIZE,
};

use crate::fingerprint::TreeFingerprint;
use crate::retry::{CallContext, RetryPolicy};

/// A published version as seen by this system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedVersion {
    pub resource: String,
    pub kind: ResourceKind,
    pub version: u64,
    /// Opaque reference consumers are linked to
    pub version_ref: String,
    /// Absent for versions published by other tools
    pub fingerprint: Option<TreeFingerprint>,
    pub created_at: DateTime<Utc>,
    pub artifact: ArtifactRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl PublishedVersion {
    /// Validate a store record of `resource`
    ///
    /// Fails with `StoreError::Registry` when the record's numbering or
    /// reference is inconsistent, or when its fingerprint tag is present
    /// but not a fingerprint.
    pub fn from_record(resource: &str, record: VersionRecord) -> StoreResult<Self> {
        if record.resource != resource {
            return Err(StoreError::registry(
                resource,
                format!("listing returned a version of {:?}", record.resource),
            ));
        }
        if record.version == 0 {
            return Err(StoreError::registry(resource, "version number 0"));
        }
        let expected_ref = record.kind.version_ref(resource, record.version);
        if record.version_ref != expected_ref {
            return Err(StoreError::registry(
                resource,
                format!(
                    "version {} has reference {:?}, expected {:?}",
                    record.version, record.version_ref, expected_ref
                ),
            ));
        }

        let fingerprint = match record.tags.get(FINGERPRINT_TAG) {
            None => None,
            Some(tag) => Some(tag.parse::<TreeFingerprint>().map_err(|e| {
                StoreError::registry(resource, format!("version {}: {}", record.version, e))
            })?),
        };

        Ok(Self {
            resource: record.resource,
            kind: record.kind,
            version: record.version,
            version_ref: record.version_ref,
            fingerprint,
            created_at: record.created_at,
            artifact: record.artifact,
            created_by: record.created_by,
        })
    }
}

/// Read-only view of the published versions in a store
pub struct VersionRegistry<'a> {
    store: &'a dyn RemoteStore,
    retry: &'a RetryPolicy,
    page_size: usize,
}

impl<'a> VersionRegistry<'a> {
    pub fn new(store: &'a dyn RemoteStore, retry: &'a RetryPolicy) -> Self {
        Self {
            store,
            retry,
            page_size: MAX_PAGE_SIZE,
        }
    }

    /// Page size requested from the store (clamped to 1..=50)
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// All versions of `resource`, ascending by version number
    pub fn list(&self, resource: &str, ctx: &CallContext) -> StoreResult<Vec<PublishedVersion>> {
        self.list_with(self.retry, resource, ctx)
    }

    /// The most recent version built from `fingerprint`
    ///
    /// Most recent means latest `created_at`, ties broken by the higher
    /// version number.
    pub fn find_by_fingerprint(
        &self,
        resource: &str,
        fingerprint: &TreeFingerprint,
        ctx: &CallContext,
    ) -> StoreResult<Option<PublishedVersion>> {
        let versions = self.list_with(self.retry, resource, ctx)?;
        Ok(most_recent(resource, fingerprint, versions))
    }

    /// Like `find_by_fingerprint`, but each page gets a single attempt
    ///
    /// For callers that already run inside a retry loop.
    pub fn find_by_fingerprint_once(
        &self,
        resource: &str,
        fingerprint: &TreeFingerprint,
        ctx: &CallContext,
    ) -> StoreResult<Option<PublishedVersion>> {
        let single = self.retry.clone().with_max_attempts(1);
        let versions = self.list_with(&single, resource, ctx)?;
        Ok(most_recent(resource, fingerprint, versions))
    }

    fn list_with(
        &self,
        retry: &RetryPolicy,
        resource: &str,
        ctx: &CallContext,
    ) -> StoreResult<Vec<PublishedVersion>> {
        let mut versions = Vec::new();
        let mut token: Option<String> = None;
        let mut seen = HashSet::new();
        let mut pages = 0u32;

        loop {
            let page = retry.run(ctx, StoreOp::ListVersions, |_| {
                self.store
                    .list_versions(resource, token.as_deref(), self.page_size)
            })?;
            pages += 1;

            for record in page.versions {
                versions.push(PublishedVersion::from_record(resource, record)?);
            }

            match page.next_token {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(StoreError::registry(
                        resource,
                        format!("page token {:?} repeated after {} pages", next, pages),
                    ));
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }

        versions.sort_by_key(|v| v.version);
        debug!(resource, versions = versions.len(), pages, "catalog listed");
        Ok(versions)
    }
}

fn most_recent(
    resource: &str,
    fingerprint: &TreeFingerprint,
    versions: Vec<PublishedVersion>,
) -> Option<PublishedVersion> {
    let found = versions
        .into_iter()
        .filter(|v| v.fingerprint.as_ref() == Some(fingerprint))
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.version.cmp(&b.version))
        });

    debug!(
        resource,
        fingerprint = %fingerprint,
        found = found.as_ref().map(|v| v.version),
        "fingerprint lookup"
    );
    found
}
