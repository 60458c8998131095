//! Records exchanged with the remote store

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tag key carrying the tree fingerprint a version was built from
pub const FINGERPRINT_TAG: &str = "lambda-venv.fingerprint";

/// Tag key carrying the SHA-256 of the uploaded artifact
pub const ARTIFACT_SHA256_TAG: &str = "lambda-venv.artifact-sha256";

/// Largest page size `list_versions` honours
pub const MAX_PAGE_SIZE: usize = 50;

/// Kind of attachable resource a store publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Shared library layer; a consumer may attach several layers
    #[default]
    Layer,
    /// Function code package; a consumer holds exactly one
    CodeBundle,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Layer => "layer",
            ResourceKind::CodeBundle => "code_bundle",
        }
    }

    /// Reference string for a version of `resource`
    pub fn version_ref(&self, resource: &str, version: u64) -> String {
        format!("{}:{}:{}", self.as_str(), resource, version)
    }

    /// Split a reference produced by `version_ref` into its parts
    pub fn parse_version_ref(reference: &str) -> Option<(ResourceKind, &str, u64)> {
        let (rest, version) = reference.rsplit_once(':')?;
        let version = version.parse().ok()?;
        let (kind, resource) = rest.split_once(':')?;
        if resource.is_empty() {
            return None;
        }
        Some((kind.parse().ok()?, resource, version))
    }

    /// Link list of a consumer after attaching `new_ref`
    ///
    /// Layers replace any other version of the same layer in place and keep
    /// unrelated links. A code bundle replaces whatever code bundle the
    /// consumer held and goes first.
    pub fn apply_link(&self, current: &[String], new_ref: &str) -> Vec<String> {
        match self {
            ResourceKind::Layer => {
                let target = Self::parse_version_ref(new_ref).map(|(_, r, _)| r);
                let mut links = Vec::with_capacity(current.len() + 1);
                let mut placed = false;
                for existing in current {
                    let same_layer = match (Self::parse_version_ref(existing), target) {
                        (Some((ResourceKind::Layer, resource, _)), Some(target)) => {
                            resource == target
                        }
                        _ => existing == new_ref,
                    };
                    if !same_layer {
                        links.push(existing.clone());
                    } else if !placed {
                        links.push(new_ref.to_string());
                        placed = true;
                    }
                }
                if !placed {
                    links.push(new_ref.to_string());
                }
                links
            }
            ResourceKind::CodeBundle => {
                let mut links = vec![new_ref.to_string()];
                links.extend(
                    current
                        .iter()
                        .filter(|r| {
                            !matches!(
                                Self::parse_version_ref(r),
                                Some((ResourceKind::CodeBundle, _, _))
                            ) && r.as_str() != new_ref
                        })
                        .cloned(),
                );
                links
            }
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "layer" => Ok(ResourceKind::Layer),
            "code_bundle" => Ok(ResourceKind::CodeBundle),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Location of an uploaded artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Store key the bytes live under
    pub location_key: String,
    /// SHA-256 of the stored bytes as computed by the store
    pub sha256: String,
    /// Stored size in bytes
    pub size: u64,
}

/// A registered version as recorded by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub resource: String,
    pub kind: ResourceKind,
    /// Store-assigned version number, starting at 1
    pub version: u64,
    /// Opaque reference used when linking consumers
    pub version_ref: String,
    pub created_at: DateTime<Utc>,
    pub artifact: ArtifactRef,
    /// Free-form metadata, including `FINGERPRINT_TAG`
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Principal that registered the version, when the store knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl VersionRecord {
    /// Value of the fingerprint tag, if present
    pub fn fingerprint_tag(&self) -> Option<&str> {
        self.tags.get(FINGERPRINT_TAG).map(String::as_str)
    }
}

/// One page of `list_versions`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionPage {
    pub versions: Vec<VersionRecord>,
    /// Token for the next page; `None` on the last page
    pub next_token: Option<String>,
}

/// Hex SHA-256 of `bytes`
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reject keys that could leave the artifact area
pub(crate) fn validate_location_key(key: &str) -> Result<(), crate::StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(crate::StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Slice `records` into a page starting at `page_token` (an offset)
pub(crate) fn paginate(
    resource: &str,
    records: Vec<VersionRecord>,
    page_token: Option<&str>,
    page_size: usize,
) -> Result<VersionPage, crate::StoreError> {
    let offset = match page_token {
        None => 0,
        Some(token) => token.parse::<usize>().map_err(|_| {
            crate::StoreError::registry(resource, format!("invalid page token: {}", token))
        })?,
    };
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let end = (offset + page_size).min(records.len());
    let versions = if offset < records.len() {
        records[offset..end].to_vec()
    } else {
        Vec::new()
    };
    let next_token = if end < records.len() {
        Some(end.to_string())
    } else {
        None
    };
    Ok(VersionPage {
        versions,
        next_token,
    })
}
