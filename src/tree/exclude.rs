//! Exclusion rules for tree scanning
//!
//! Handles default exclusions and `.layerignore` files.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Default patterns excluded from every snapshot
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "__pycache__",
    "**/__pycache__",
    "__pycache__/**",
    "**/__pycache__/**",
    "*.pyc",
    "**/*.pyc",
    "*.pyo",
    "**/*.pyo",
    ".DS_Store",
    "**/.DS_Store",
];

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("cannot read ignore file {path}: {source}")]
    IgnoreFile {
        path: String,
        source: std::io::Error,
    },

    #[error("glob pattern error: {0}")]
    Glob(#[from] globset::Error),
}

/// Exclusion rules for filtering tree entries
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    glob_set: GlobSet,
}

impl ExcludeRules {
    /// Create exclusion rules holding only the defaults
    pub fn new() -> Result<Self, ExcludeError> {
        Self::build(DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect())
    }

    fn build(patterns: Vec<String>) -> Result<Self, ExcludeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            glob_set: builder.build()?,
            patterns,
        })
    }

    /// Add patterns from an ignore file
    ///
    /// One glob per line; blank lines and `#` comments are skipped. A
    /// trailing `/` matches the directory and everything below it.
    pub fn with_ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let contents = fs::read_to_string(path).map_err(|source| ExcludeError::IgnoreFile {
            path: path.display().to_string(),
            source,
        })?;
        let patterns: Vec<&str> = contents
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        self.with_patterns(&patterns)
    }

    /// Add additional patterns
    pub fn with_patterns<S: AsRef<str>>(self, patterns: &[S]) -> Result<Self, ExcludeError> {
        let mut all = self.patterns;
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            match pattern.strip_suffix('/') {
                Some(dir) if !dir.is_empty() => {
                    all.push(dir.to_string());
                    all.push(format!("{}/**", dir));
                }
                _ => all.push(pattern.to_string()),
            }
        }
        Self::build(all)
    }

    /// Patterns in effect, defaults first
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check if a root-relative path should be excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy().replace('\\', "/");
        self.glob_set.is_match(path_str.as_str())
    }
}
