//! Artifact publishing
//!
//! Write side of the remote store. Uploads go to a content-derived key so
//! repeating one overwrites rather than duplicates. Registration is
//! check-then-register on every attempt, and a conflict reported by the
//! store means a concurrent publisher won: the winner is re-queried and
//! returned instead of an error.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use lambda_venv_store::{
    ArtifactRef, RemoteStore, StoreError, StoreOp, VersionRecord, ARTIFACT_SHA256_TAG,
    FINGERPRINT_TAG,
};

use crate::bundle::Artifact;
use crate::registry::{PublishedVersion, VersionRegistry};
use crate::retry::{CallContext, RetryPolicy};

/// Errors for publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(
        "store reported {actual_sha256} ({actual_size} bytes) for {location_key}, \
         uploaded {expected_sha256} ({expected_size} bytes)"
    )]
    IntegrityMismatch {
        location_key: String,
        expected_sha256: String,
        expected_size: u64,
        actual_sha256: String,
        actual_size: u64,
    },
}

/// Result of a publish
#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub version: PublishedVersion,
    /// Whether this call registered the version
    pub created: bool,
}

enum Registration {
    Existing(PublishedVersion),
    Created(VersionRecord),
    /// Registered by an earlier attempt whose response was lost
    Recovered(PublishedVersion),
    Conflict { existing_version: u64 },
}

/// Uploads artifacts and registers them as versions
pub struct Publisher<'a> {
    store: &'a dyn RemoteStore,
    retry: &'a RetryPolicy,
    registry: VersionRegistry<'a>,
}

impl<'a> Publisher<'a> {
    pub fn new(store: &'a dyn RemoteStore, retry: &'a RetryPolicy) -> Self {
        Self {
            store,
            retry,
            registry: VersionRegistry::new(store, retry),
        }
    }

    /// Use `registry` for the check half of check-then-register
    pub fn with_registry(mut self, registry: VersionRegistry<'a>) -> Self {
        self.registry = registry;
        self
    }

    /// Upload `artifact` and register it as a version of `resource`
    pub fn publish(
        &self,
        resource: &str,
        artifact: &Artifact,
        ctx: &CallContext,
    ) -> Result<PublishOutcome, PublishError> {
        let uploaded = self.upload(resource, artifact, ctx)?;

        let mut tags = BTreeMap::new();
        tags.insert(FINGERPRINT_TAG.to_string(), artifact.fingerprint.to_string());
        tags.insert(ARTIFACT_SHA256_TAG.to_string(), artifact.sha256.clone());

        // Set once a register call has failed; a version found afterwards
        // that points at our upload is one that call committed.
        let mut register_failed = false;
        let registration = self.retry.run(ctx, StoreOp::RegisterVersion, |attempt| {
            if let Some(existing) =
                self.registry
                    .find_by_fingerprint_once(resource, &artifact.fingerprint, ctx)?
            {
                if register_failed && existing.artifact == uploaded {
                    return Ok(Registration::Recovered(existing));
                }
                return Ok(Registration::Existing(existing));
            }
            debug!(resource, attempt, "registering new version");
            match self.store.register_version(resource, &uploaded, &tags) {
                Ok(record) => Ok(Registration::Created(record)),
                Err(StoreError::Conflict {
                    existing_version, ..
                }) => Ok(Registration::Conflict { existing_version }),
                Err(e) => {
                    register_failed = true;
                    Err(e)
                }
            }
        })?;

        match registration {
            Registration::Created(record) => {
                let version = PublishedVersion::from_record(resource, record)?;
                info!(
                    resource,
                    version = version.version,
                    fingerprint = %artifact.fingerprint,
                    "version published"
                );
                Ok(PublishOutcome {
                    version,
                    created: true,
                })
            }
            Registration::Recovered(version) => {
                info!(
                    resource,
                    version = version.version,
                    "registration response lost, version recovered"
                );
                Ok(PublishOutcome {
                    version,
                    created: true,
                })
            }
            Registration::Existing(version) => {
                info!(
                    resource,
                    version = version.version,
                    "version already registered for fingerprint"
                );
                Ok(PublishOutcome {
                    version,
                    created: false,
                })
            }
            Registration::Conflict { existing_version } => {
                info!(
                    resource,
                    existing_version, "concurrent publisher won, adopting its version"
                );
                let winner = self
                    .registry
                    .find_by_fingerprint(resource, &artifact.fingerprint, ctx)?
                    .ok_or_else(|| {
                        StoreError::registry(
                            resource,
                            format!(
                                "conflict on version {} but no version carries {}",
                                existing_version, artifact.fingerprint
                            ),
                        )
                    })?;
                Ok(PublishOutcome {
                    version: winner,
                    created: false,
                })
            }
        }
    }

    fn upload(
        &self,
        resource: &str,
        artifact: &Artifact,
        ctx: &CallContext,
    ) -> Result<ArtifactRef, PublishError> {
        let location_key = artifact.location_key(resource);
        let uploaded = self.retry.run(ctx, StoreOp::UploadArtifact, |_| {
            self.store.upload_artifact(&artifact.bytes, &location_key)
        })?;

        if uploaded.sha256 != artifact.sha256 || uploaded.size != artifact.size() {
            return Err(PublishError::IntegrityMismatch {
                location_key,
                expected_sha256: artifact.sha256.clone(),
                expected_size: artifact.size(),
                actual_sha256: uploaded.sha256,
                actual_size: uploaded.size,
            });
        }

        debug!(key = %uploaded.location_key, size = uploaded.size, "artifact uploaded");
        Ok(uploaded)
    }
}
