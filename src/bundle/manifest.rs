//! Artifact manifest
//!
//! Records every file packed into an artifact with its hash. Contains no
//! timestamps, so the same tree always yields the same manifest.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::fingerprint::TreeFingerprint;

/// Schema version for artifact_manifest.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "lambda-venv/artifact_manifest@1";

/// A single file in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path inside the archive
    pub path: String,

    /// Size in bytes
    pub size: u64,

    /// SHA-256 of the file contents
    pub sha256: String,

    /// Normalized mode (0o644 or 0o755)
    pub mode: u32,
}

/// Artifact manifest (artifact_manifest.json)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Fingerprint of the packed tree
    pub fingerprint: TreeFingerprint,

    /// SHA-256 of the compressed artifact bytes
    pub artifact_sha256: String,

    /// Sum of file sizes before compression
    pub uncompressed_size: u64,

    /// Archive prefix, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// All files in archive order
    pub entries: Vec<ManifestEntry>,
}

impl ArtifactManifest {
    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        fs::write(path, json)
    }

    /// Load from file
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
    }

    /// Number of files
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    /// Find an entry by path
    pub fn find_entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}
