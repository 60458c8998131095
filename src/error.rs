//! Error kinds and exit codes
//!
//! Every module keeps its own error enum; `PipelineError` aggregates them
//! for the pipeline and the binary, and `ErrorKind` classifies the result
//! into the categories reported to callers.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lambda_venv_store::StoreError;

use crate::bundle::BuildError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::publish::PublishError;
use crate::state::PipelineStateError;
use crate::tree::{TreeError, VenvError};

/// Category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad invocation or internal fault
    Internal,
    Config,
    Auth,
    /// Local filesystem or unsupported tree entries
    Io,
    /// Size limits or content changing during a build
    Build,
    Transient,
    /// Only surfaced when conflict recovery itself fails
    Conflict,
    Quota,
    NotFound,
    /// Malformed or inconsistent remote metadata
    Registry,
    /// Store returned a different artifact than was uploaded
    Integrity,
    Cancelled,
    Timeout,
}

impl ErrorKind {
    /// Process exit code for this kind
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::Config => 2,
            ErrorKind::Auth => 3,
            ErrorKind::Io => 10,
            ErrorKind::Build => 11,
            ErrorKind::Transient => 20,
            ErrorKind::Quota => 30,
            ErrorKind::NotFound => 31,
            ErrorKind::Conflict | ErrorKind::Registry => 32,
            ErrorKind::Integrity => 33,
            ErrorKind::Cancelled => 80,
            ErrorKind::Timeout => 81,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Internal => "internal",
            ErrorKind::Config => "config",
            ErrorKind::Auth => "auth",
            ErrorKind::Io => "io",
            ErrorKind::Build => "build",
            ErrorKind::Transient => "transient",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Quota => "quota",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Registry => "registry",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// Classify a store error
    pub fn of_store(err: &StoreError) -> Self {
        match err {
            StoreError::Transient { .. } | StoreError::LockTimeout(_) => ErrorKind::Transient,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::Quota { .. } => ErrorKind::Quota,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Registry { .. } | StoreError::Json(_) => ErrorKind::Registry,
            StoreError::Auth { .. } => ErrorKind::Auth,
            StoreError::Cancelled { .. } => ErrorKind::Cancelled,
            StoreError::DeadlineExceeded { .. } => ErrorKind::Timeout,
            StoreError::InvalidKey(_) => ErrorKind::Config,
            StoreError::Io(_) => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the pipeline and the binary
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Usage(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("credentials: {0}")]
    Credentials(#[from] CredentialError),

    #[error("virtual environment: {0}")]
    Venv(#[from] VenvError),

    #[error("tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("state error: {0}")]
    State(#[from] PipelineStateError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Usage(_) => ErrorKind::Internal,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Credentials(_) => ErrorKind::Auth,
            PipelineError::Venv(_) => ErrorKind::Io,
            PipelineError::Tree(e) => tree_kind(e),
            PipelineError::Build(e) => match e {
                BuildError::Tree(e) => tree_kind(e),
                BuildError::Io(_) => ErrorKind::Io,
                BuildError::SizeExceeded { .. } | BuildError::ContentChanged { .. } => {
                    ErrorKind::Build
                }
            },
            PipelineError::Store(e) => ErrorKind::of_store(e),
            PipelineError::Publish(PublishError::Store(e)) => ErrorKind::of_store(e),
            PipelineError::Publish(PublishError::IntegrityMismatch { .. }) => {
                ErrorKind::Integrity
            }
            PipelineError::State(_) | PipelineError::Serialization(_) => ErrorKind::Internal,
            PipelineError::Io(_) => ErrorKind::Io,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::DeadlineExceeded => ErrorKind::Timeout,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

fn tree_kind(err: &TreeError) -> ErrorKind {
    match err {
        TreeError::Exclude(_) | TreeError::InvalidPrefix(_) => ErrorKind::Config,
        _ => ErrorKind::Io,
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
