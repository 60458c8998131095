//! Directory tree scanning
//!
//! Turns a directory into a `TreeSnapshot`: the sorted list of regular
//! files that the fingerprint and the artifact are both computed from.
//!
//! Symlinks are followed. A link resolving inside the root stands for the
//! content it points at; a link escaping the root, a dangling link, or a
//! link cycle fails the scan. Sockets, FIFOs and device nodes are rejected.
//! Directories carry no content of their own, so empty directories are not
//! represented.

mod exclude;
mod venv;

pub use exclude::{ExcludeError, ExcludeRules, DEFAULT_EXCLUDES};
pub use venv::{locate_venv, site_packages, VenvError, VenvSources};

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Normalized mode of a non-executable file
pub const MODE_FILE: u32 = 0o644;

/// Normalized mode of an executable file
pub const MODE_EXECUTABLE: u32 = 0o755;

/// Errors for tree scanning
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("cannot read tree root {path}: {source}")]
    Root { path: PathBuf, source: io::Error },

    #[error("tree root is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("symlink escapes tree root: {0}")]
    SymlinkEscapesRoot(PathBuf),

    #[error("dangling symlink: {0}")]
    DanglingSymlink(PathBuf),

    #[error("symlink cycle at {0}")]
    SymlinkCycle(PathBuf),

    #[error("unsupported entry type (socket, fifo or device): {0}")]
    Unsupported(PathBuf),

    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("invalid archive prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("exclude rules error: {0}")]
    Exclude(#[from] ExcludeError),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

impl TreeError {
    fn io(path: &Path, source: io::Error) -> Self {
        TreeError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A regular file in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Archive path: `/`-separated, relative, prefix included
    pub path: String,
    /// SHA-256 of the content, lowercase hex
    pub sha256: String,
    /// `MODE_FILE` or `MODE_EXECUTABLE`
    pub mode: u32,
    /// Content size in bytes
    pub size: u64,
    /// Location the content was read from
    pub source: PathBuf,
}

/// Sorted listing of the files under a tree root
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    /// Canonical tree root
    pub root: PathBuf,
    /// Archive prefix prepended to every entry path
    pub prefix: Option<String>,
    /// Entries sorted by path bytes
    pub entries: Vec<FileEntry>,
    /// Sum of entry sizes
    pub total_size: u64,
}

impl TreeSnapshot {
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry by archive path
    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_bytes().cmp(path.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }
}

/// Scanner configuration for one tree
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
    prefix: Option<String>,
    excludes: Vec<String>,
    ignore_file: Option<PathBuf>,
}

impl TreeScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: None,
            excludes: Vec::new(),
            ignore_file: None,
        }
    }

    /// Place every entry under `prefix` inside the archive
    ///
    /// An empty prefix means none.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    /// Add exclusion globs on top of the defaults
    pub fn with_excludes<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.excludes
            .extend(patterns.iter().map(|p| p.as_ref().to_string()));
        self
    }

    /// Read extra exclusion globs from `path` if it exists
    pub fn with_ignore_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignore_file = Some(path.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn exclude_rules(&self) -> Result<ExcludeRules, TreeError> {
        let mut rules = ExcludeRules::new()?.with_patterns(&self.excludes)?;
        if let Some(path) = &self.ignore_file {
            if path.is_file() {
                rules = rules.with_ignore_file(path)?;
            }
        }
        Ok(rules)
    }

    /// Walk the tree and hash every file
    pub fn scan(&self) -> Result<TreeSnapshot, TreeError> {
        let prefix = self.prefix.as_deref().map(normalize_prefix).transpose()?;
        let rules = self.exclude_rules()?;

        let root = self.root.canonicalize().map_err(|source| TreeError::Root {
            path: self.root.clone(),
            source,
        })?;
        if !root.is_dir() {
            return Err(TreeError::NotADirectory(self.root.clone()));
        }

        let mut candidates = Vec::new();
        let walker = WalkDir::new(&root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(&root) {
                Ok(rel) => rel.as_os_str().is_empty() || !rules.is_excluded(rel),
                Err(_) => true,
            });

        for entry in walker {
            let entry = entry.map_err(classify_walk_error)?;
            let path = entry.path();
            let rel = path
                .strip_prefix(&root)
                .map_err(|_| TreeError::SymlinkEscapesRoot(path.to_path_buf()))?;
            if rel.as_os_str().is_empty() {
                continue;
            }

            if entry.path_is_symlink() {
                let target = path.canonicalize().map_err(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        TreeError::DanglingSymlink(path.to_path_buf())
                    } else {
                        TreeError::io(path, e)
                    }
                })?;
                if !target.starts_with(&root) {
                    return Err(TreeError::SymlinkEscapesRoot(path.to_path_buf()));
                }
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() {
                return Err(TreeError::Unsupported(path.to_path_buf()));
            }

            let metadata = entry.metadata().map_err(classify_walk_error)?;
            let rel = archive_path(rel)?;
            candidates.push(Candidate {
                path: match &prefix {
                    Some(prefix) => format!("{}/{}", prefix, rel),
                    None => rel,
                },
                source: path.to_path_buf(),
                mode: normalized_mode(&metadata),
            });
        }

        let mut entries = candidates
            .into_par_iter()
            .map(|c| {
                let (sha256, size) = hash_file(&c.source)?;
                Ok(FileEntry {
                    path: c.path,
                    sha256,
                    mode: c.mode,
                    size,
                    source: c.source,
                })
            })
            .collect::<Result<Vec<_>, TreeError>>()?;
        entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

        let total_size = entries.iter().map(|e| e.size).sum();
        debug!(
            root = %root.display(),
            files = entries.len(),
            total_size,
            "tree scanned"
        );

        Ok(TreeSnapshot {
            root,
            prefix,
            entries,
            total_size,
        })
    }
}

struct Candidate {
    path: String,
    source: PathBuf,
    mode: u32,
}

/// SHA-256 and length of a file's content
pub fn hash_file(path: &Path) -> Result<(String, u64), TreeError> {
    let mut file = File::open(path).map_err(|e| TreeError::io(path, e))?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(|e| TreeError::io(path, e))?;
    Ok((hex::encode(hasher.finalize()), size))
}

fn classify_walk_error(err: walkdir::Error) -> TreeError {
    if let Some(ancestor) = err.loop_ancestor() {
        return TreeError::SymlinkCycle(ancestor.to_path_buf());
    }
    if let (Some(path), Some(io_err)) = (err.path(), err.io_error()) {
        let is_link = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link && io_err.kind() == io::ErrorKind::NotFound {
            return TreeError::DanglingSymlink(path.to_path_buf());
        }
    }
    TreeError::Walk(err)
}

/// `/`-joined UTF-8 form of a root-relative path
fn archive_path(rel: &Path) -> Result<String, TreeError> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| TreeError::NonUtf8Path(rel.to_path_buf()))?,
            ),
            _ => return Err(TreeError::NonUtf8Path(rel.to_path_buf())),
        }
    }
    Ok(parts.join("/"))
}

fn normalize_prefix(prefix: &str) -> Result<String, TreeError> {
    let trimmed = prefix.trim_matches('/');
    let bad = trimmed.is_empty()
        || prefix.starts_with('/')
        || trimmed.contains('\\')
        || trimmed
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(TreeError::InvalidPrefix(prefix.to_string()));
    }
    Ok(trimmed.to_string())
}

fn normalized_mode(metadata: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 != 0 {
            return MODE_EXECUTABLE;
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;
    MODE_FILE
}
