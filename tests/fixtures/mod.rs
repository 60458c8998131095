//! Shared helpers for integration tests
//!
//! Trees are written into temporary directories; the in-memory store
//! stands in for the remote service, with retry delays set to zero.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use lambda_venv::pipeline::{Pipeline, RunRequest};
use lambda_venv::retry::RetryPolicy;
use lambda_venv::store::{MemoryStore, ResourceKind};

/// Write `files` (relative path, content) under `root`
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
}

/// `{a.txt: "x", b/c.txt: "y"}`
pub fn scenario_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_tree(dir.path(), &[("a.txt", "x"), ("b/c.txt", "y")]);
    dir
}

/// A plausible site-packages tree
pub fn site_packages_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_tree(
        dir.path(),
        &[
            ("six.py", "import sys\n"),
            ("requests/__init__.py", "__version__ = '2.31.0'\n"),
            ("requests/api.py", "def get(url): ...\n"),
            ("requests/__pycache__/api.cpython-312.pyc", "\x00\x01"),
            ("requests-2.31.0.dist-info/METADATA", "Name: requests\n"),
        ],
    );
    dir
}

pub fn layer_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(ResourceKind::Layer))
}

/// Pipeline over `store` with immediate retries
pub fn pipeline(store: &Arc<MemoryStore>) -> Pipeline {
    Pipeline::new(store.clone()).with_retry_policy(RetryPolicy::immediate(4))
}

pub fn request(tree: &Path, resource: &str, consumers: &[&str]) -> RunRequest {
    RunRequest {
        tree_root: tree.to_path_buf(),
        resource: resource.to_string(),
        consumers: consumers.iter().map(|c| c.to_string()).collect(),
        dry_run: false,
    }
}
