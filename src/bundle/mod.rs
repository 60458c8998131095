//! Artifact building and canonicalization
//!
//! Serializes a tree snapshot into a gzip-compressed canonical tar archive:
//! sorted paths, mtime 0, uid/gid 0, empty owner names, modes normalized to
//! 0644/0755, GNU long-name records for paths over 100 bytes. The gzip
//! header carries mtime 0, no file name and the "unknown" OS byte, so the
//! same tree always yields byte-identical artifacts.

mod manifest;

pub use manifest::{ArtifactManifest, ManifestEntry, SCHEMA_ID, SCHEMA_VERSION};

use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::fingerprint::TreeFingerprint;
use crate::tree::{TreeError, TreeScanner, TreeSnapshot};

/// Default limit on the unpacked size of a layer (250 MiB)
pub const DEFAULT_MAX_UNCOMPRESSED_BYTES: u64 = 262_144_000;

/// gzip OS byte for "unknown"
const GZIP_OS_UNKNOWN: u8 = 255;

/// Errors for artifact building
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("uncompressed size {actual_bytes} exceeds limit {limit_bytes}")]
    SizeExceeded {
        /// Sum of file sizes in the snapshot
        actual_bytes: u64,
        /// The configured limit in bytes
        limit_bytes: u64,
    },

    #[error("file changed while archiving: {path}")]
    ContentChanged { path: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Builder for deterministic artifacts
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    /// Maximum uncompressed size in bytes (0 = no limit)
    max_uncompressed_bytes: u64,
    compression: Compression,
}

impl Default for ArtifactBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactBuilder {
    pub fn new() -> Self {
        Self {
            max_uncompressed_bytes: DEFAULT_MAX_UNCOMPRESSED_BYTES,
            compression: Compression::default(),
        }
    }

    /// Set the maximum uncompressed size in bytes
    ///
    /// A value of 0 means no limit.
    pub fn with_max_uncompressed_bytes(mut self, max_bytes: u64) -> Self {
        self.max_uncompressed_bytes = max_bytes;
        self
    }

    /// Set the gzip level (0-9)
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    /// Scan and build in one step
    pub fn build(&self, scanner: &TreeScanner) -> Result<Artifact, BuildError> {
        let snapshot = scanner.scan()?;
        self.build_snapshot(&snapshot)
    }

    /// Build the artifact for an existing snapshot
    ///
    /// Every file is re-hashed while it is archived; content that no longer
    /// matches the snapshot fails with `BuildError::ContentChanged`.
    pub fn build_snapshot(&self, snapshot: &TreeSnapshot) -> Result<Artifact, BuildError> {
        if self.max_uncompressed_bytes > 0 && snapshot.total_size > self.max_uncompressed_bytes {
            return Err(BuildError::SizeExceeded {
                actual_bytes: snapshot.total_size,
                limit_bytes: self.max_uncompressed_bytes,
            });
        }

        let encoder = GzBuilder::new()
            .mtime(0)
            .operating_system(GZIP_OS_UNKNOWN)
            .write(Vec::new(), self.compression);
        let mut builder = Builder::new(encoder);
        let mut manifest_entries = Vec::with_capacity(snapshot.entries.len());

        for entry in &snapshot.entries {
            let mut contents = Vec::with_capacity(entry.size as usize);
            File::open(&entry.source)
                .and_then(|mut f| f.read_to_end(&mut contents))
                .map_err(|source| TreeError::Io {
                    path: entry.source.clone(),
                    source,
                })?;

            if sha256_hex(&contents) != entry.sha256 {
                return Err(BuildError::ContentChanged {
                    path: entry.path.clone(),
                });
            }

            // Create canonical header
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(contents.len() as u64);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mode(entry.mode);
            builder.append_data(&mut header, &entry.path, contents.as_slice())?;

            manifest_entries.push(ManifestEntry {
                path: entry.path.clone(),
                size: entry.size,
                sha256: entry.sha256.clone(),
                mode: entry.mode,
            });
        }

        let bytes = builder.into_inner()?.finish()?;
        let sha256 = sha256_hex(&bytes);
        let fingerprint = TreeFingerprint::of_snapshot(snapshot);

        debug!(
            fingerprint = %fingerprint,
            files = snapshot.file_count(),
            uncompressed = snapshot.total_size,
            compressed = bytes.len(),
            "artifact built"
        );

        let manifest = ArtifactManifest {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            fingerprint: fingerprint.clone(),
            artifact_sha256: sha256.clone(),
            uncompressed_size: snapshot.total_size,
            prefix: snapshot.prefix.clone(),
            entries: manifest_entries,
        };

        Ok(Artifact {
            bytes,
            sha256,
            fingerprint,
            uncompressed_size: snapshot.total_size,
            file_count: snapshot.file_count(),
            manifest,
        })
    }
}

/// Build an artifact of `root` with default settings
pub fn build(root: &Path) -> Result<Artifact, BuildError> {
    ArtifactBuilder::new().build(&TreeScanner::new(root))
}

/// A built artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    /// gzip-compressed tar bytes
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`
    pub sha256: String,
    /// Fingerprint of the tree the artifact was built from
    pub fingerprint: TreeFingerprint,
    /// Sum of file sizes before compression
    pub uncompressed_size: u64,
    pub file_count: usize,
    pub manifest: ArtifactManifest,
}

impl Artifact {
    /// Compressed size in bytes
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Content-derived store key for this artifact under `resource`
    pub fn location_key(&self, resource: &str) -> String {
        format!("{}/{}.tar.gz", resource, self.sha256)
    }

    /// Write the archive to a file
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, &self.bytes)
    }

    /// Write the manifest next to the archive
    pub fn write_manifest(&self, path: &Path) -> io::Result<()> {
        self.manifest.write_to_file(path)
    }

    /// Default manifest path for an archive written to `archive_path`
    pub fn manifest_path_for(archive_path: &Path) -> PathBuf {
        let mut name = archive_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".manifest.json");
        archive_path.with_file_name(name)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
