//! lambda-venv - idempotent packaging and publishing of Python environments
//!
//! Packs an installed virtual environment (or any directory tree) into a
//! deterministic artifact, publishes it as a versioned layer only when no
//! version with the same content fingerprint exists, and attaches the
//! resolved version to consumer functions.

pub mod bundle;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fingerprint;
pub mod link;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod retry;
pub mod signal;
pub mod state;
pub mod tree;

pub use bundle::{Artifact, ArtifactBuilder, ArtifactManifest, BuildError};
pub use config::{ConfigError, EffectiveConfig, Settings};
pub use credentials::{
    AssumeRoleProvider, CredentialError, CredentialProvider, Credentials, EnvCredentialProvider,
    StaticCredentialProvider,
};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use fingerprint::{fingerprint, TreeFingerprint};
pub use link::{ConsumerLink, Linker};
pub use pipeline::{Pipeline, PipelineFailure, PipelineReport, RunRequest, ScanOptions};
pub use publish::{PublishError, PublishOutcome, Publisher};
pub use registry::{PublishedVersion, VersionRegistry};
pub use retry::{CallContext, CancelToken, RetryPolicy};
pub use state::{Component, PipelineState};
pub use tree::{FileEntry, TreeError, TreeScanner, TreeSnapshot};

pub use lambda_venv_store as store;
