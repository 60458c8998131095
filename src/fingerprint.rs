//! Tree fingerprints
//!
//! A fingerprint is one SHA-256 over the sorted snapshot entries, each fed
//! to the hasher as
//!
//! ```text
//! <path> NUL <mode, octal> NUL <content sha256, hex> LF
//! ```
//!
//! Only paths, normalized modes and content take part, so enumeration
//! order, timestamps and ownership never change the result. An empty tree
//! hashes nothing and yields the digest of the empty byte string.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::tree::{TreeError, TreeScanner, TreeSnapshot};

/// Textual prefix of a fingerprint
pub const FINGERPRINT_PREFIX: &str = "sha256:";

/// Hex digest of the empty tree
pub const EMPTY_TREE_DIGEST: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Content fingerprint of a directory tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TreeFingerprint {
    digest: String,
}

/// Errors parsing a fingerprint
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FingerprintParseError {
    #[error("fingerprint must start with \"sha256:\": {0:?}")]
    MissingPrefix(String),

    #[error("fingerprint digest must be 64 lowercase hex characters: {0:?}")]
    BadDigest(String),
}

impl TreeFingerprint {
    /// Fingerprint of a snapshot
    pub fn of_snapshot(snapshot: &TreeSnapshot) -> Self {
        let mut hasher = Sha256::new();
        for entry in &snapshot.entries {
            hasher.update(entry.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(format!("{:o}", entry.mode).as_bytes());
            hasher.update([0u8]);
            hasher.update(entry.sha256.as_bytes());
            hasher.update(b"\n");
        }
        Self {
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Fingerprint of the empty tree
    pub fn empty() -> Self {
        Self {
            digest: EMPTY_TREE_DIGEST.to_string(),
        }
    }

    /// Lowercase hex digest without the prefix
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for TreeFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", FINGERPRINT_PREFIX, self.digest)
    }
}

impl FromStr for TreeFingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digest = s
            .strip_prefix(FINGERPRINT_PREFIX)
            .ok_or_else(|| FingerprintParseError::MissingPrefix(s.to_string()))?;
        let valid = digest.len() == 64
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(FingerprintParseError::BadDigest(s.to_string()));
        }
        Ok(Self {
            digest: digest.to_string(),
        })
    }
}

impl TryFrom<String> for TreeFingerprint {
    type Error = FingerprintParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TreeFingerprint> for String {
    fn from(fp: TreeFingerprint) -> Self {
        fp.to_string()
    }
}

/// Scan `root` with default settings and fingerprint it
pub fn fingerprint(root: &Path) -> Result<TreeFingerprint, TreeError> {
    fingerprint_with(&TreeScanner::new(root))
}

/// Scan with a configured scanner and fingerprint the result
pub fn fingerprint_with(scanner: &TreeScanner) -> Result<TreeFingerprint, TreeError> {
    let snapshot = scanner.scan()?;
    Ok(TreeFingerprint::of_snapshot(&snapshot))
}
