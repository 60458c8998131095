//! Pipeline orchestration
//!
//! Drives one invocation through the state machine:
//! - Fingerprint the tree
//! - Look the fingerprint up in the version registry
//! - On a miss, build the artifact and publish it
//! - Link the resolved version to every consumer
//!
//! Failures are attributed to the component that raised them and carry
//! what had already happened remotely (version created, consumers linked).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn};

use lambda_venv_store::{RemoteStore, MAX_PAGE_SIZE};

use crate::bundle::ArtifactBuilder;
use crate::error::{ErrorKind, PipelineError};
use crate::fingerprint::TreeFingerprint;
use crate::link::{ConsumerLink, Linker};
use crate::publish::Publisher;
use crate::registry::{PublishedVersion, VersionRegistry};
use crate::retry::{CallContext, RetryPolicy};
use crate::state::{Component, PipelineState, StateTracker};
use crate::tree::TreeScanner;

/// How the input tree is enumerated
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Archive prefix; `None` or empty packs files at the archive root
    pub prefix: Option<String>,
    /// Exclusion globs on top of the defaults
    pub excludes: Vec<String>,
    /// Ignore file, relative paths resolved against the tree root
    pub ignore_file: Option<PathBuf>,
}

impl ScanOptions {
    pub fn scanner(&self, root: &Path) -> TreeScanner {
        let mut scanner = TreeScanner::new(root).with_excludes(&self.excludes);
        if let Some(prefix) = &self.prefix {
            scanner = scanner.with_prefix(prefix.clone());
        }
        if let Some(ignore) = &self.ignore_file {
            scanner = scanner.with_ignore_file(root.join(ignore));
        }
        scanner
    }
}

/// One pipeline invocation
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub tree_root: PathBuf,
    pub resource: String,
    pub consumers: Vec<String>,
    /// Stop before any remote mutation
    pub dry_run: bool,
}

/// Outcome of a successful invocation
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub final_state: PipelineState,
    pub resource: String,
    pub fingerprint: TreeFingerprint,
    /// An existing version was used instead of publishing
    pub reused: bool,
    pub dry_run: bool,
    /// This invocation registered the version
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<PublishedVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
    pub file_count: usize,
    /// Consumers the version is (or in a dry run, would be) attached to
    pub consumers: Vec<String>,
    pub links: Vec<ConsumerLink>,
    pub states: Vec<PipelineState>,
}

/// A failed invocation
#[derive(Debug)]
pub struct PipelineFailure {
    /// Last state reached before FAILED
    pub state: PipelineState,
    pub component: Component,
    pub error: PipelineError,
    pub resource: String,
    pub fingerprint: Option<TreeFingerprint>,
    pub version: Option<PublishedVersion>,
    pub version_created: bool,
    pub linked_consumers: Vec<String>,
}

impl PipelineFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "final_state": PipelineState::Failed,
            "last_state": self.state,
            "component": self.component,
            "kind": self.kind(),
            "error": self.error.to_string(),
            "exit_code": self.exit_code(),
            "resource": self.resource,
            "fingerprint": self.fingerprint,
            "version": self.version,
            "version_created": self.version_created,
            "linked_consumers": self.linked_consumers,
        })
    }
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed after {}: {}", self.component, self.state, self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

type Attributed = (Component, PipelineError);

fn within<E: Into<PipelineError>>(component: Component) -> impl FnOnce(E) -> Attributed {
    move |e| (component, e.into())
}

fn checkpoint(ctx: &CallContext) -> Result<(), Attributed> {
    if ctx.cancel_token().is_cancelled() {
        return Err((Component::Pipeline, PipelineError::Cancelled));
    }
    if ctx.remaining().is_some_and(|r| r.is_zero()) {
        return Err((Component::Pipeline, PipelineError::DeadlineExceeded));
    }
    Ok(())
}

/// What has happened so far, kept for failure reports
#[derive(Default)]
struct Progress {
    fingerprint: Option<TreeFingerprint>,
    version: Option<PublishedVersion>,
    created: bool,
    linked: Vec<String>,
}

/// Fingerprint → lookup → build → publish → link
pub struct Pipeline {
    store: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    scan: ScanOptions,
    builder: ArtifactBuilder,
    page_size: usize,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            scan: ScanOptions::default(),
            builder: ArtifactBuilder::new(),
            page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_scan_options(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_builder(mut self, builder: ArtifactBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn store(&self) -> &dyn RemoteStore {
        &*self.store
    }

    /// Run one invocation to LINKED, or to CACHE_HIT/BUILT in a dry run
    pub fn run(
        &self,
        request: &RunRequest,
        ctx: &CallContext,
    ) -> Result<PipelineReport, PipelineFailure> {
        let span = info_span!("pipeline", resource = %request.resource);
        let _guard = span.enter();

        let mut tracker = StateTracker::new();
        let mut progress = Progress::default();

        match self.execute(request, ctx, &mut tracker, &mut progress) {
            Ok(report) => Ok(report),
            Err((component, error)) => {
                let state = tracker.fail();
                warn!(
                    state = %state,
                    component = %component,
                    kind = %error.kind(),
                    error = %error,
                    "pipeline failed"
                );
                Err(PipelineFailure {
                    state,
                    component,
                    error,
                    resource: request.resource.clone(),
                    fingerprint: progress.fingerprint,
                    version: progress.version,
                    version_created: progress.created,
                    linked_consumers: progress.linked,
                })
            }
        }
    }

    fn execute(
        &self,
        request: &RunRequest,
        ctx: &CallContext,
        tracker: &mut StateTracker,
        progress: &mut Progress,
    ) -> Result<PipelineReport, Attributed> {
        if request.resource.is_empty() {
            return Err((
                Component::Pipeline,
                PipelineError::Usage("resource name is empty".to_string()),
            ));
        }
        let consumers = dedup(&request.consumers);
        let store = &*self.store;

        // 1. Fingerprint
        checkpoint(ctx)?;
        let snapshot = self
            .scan
            .scanner(&request.tree_root)
            .scan()
            .map_err(within(Component::Fingerprinter))?;
        let fingerprint = TreeFingerprint::of_snapshot(&snapshot);
        progress.fingerprint = Some(fingerprint.clone());
        tracker
            .transition(PipelineState::Fingerprinted)
            .map_err(within(Component::Pipeline))?;
        info!(
            fingerprint = %fingerprint,
            files = snapshot.file_count(),
            bytes = snapshot.total_size,
            "tree fingerprinted"
        );

        // 2. Registry lookup
        checkpoint(ctx)?;
        let registry = || VersionRegistry::new(store, &self.retry).with_page_size(self.page_size);
        let existing = registry()
            .find_by_fingerprint(&request.resource, &fingerprint, ctx)
            .map_err(within(Component::VersionRegistry))?;

        let mut report = PipelineReport {
            final_state: PipelineState::Start,
            resource: request.resource.clone(),
            fingerprint: fingerprint.clone(),
            reused: false,
            dry_run: request.dry_run,
            created: false,
            version: None,
            artifact_sha256: None,
            artifact_size: None,
            file_count: snapshot.file_count(),
            consumers: consumers.clone(),
            links: Vec::new(),
            states: Vec::new(),
        };

        let version = match existing {
            Some(version) => {
                tracker
                    .transition(PipelineState::CacheHit)
                    .map_err(within(Component::Pipeline))?;
                info!(version = version.version, "cache hit");
                report.reused = true;
                progress.version = Some(version.clone());
                report.artifact_sha256 = Some(version.artifact.sha256.clone());
                report.artifact_size = Some(version.artifact.size);
                report.version = Some(version.clone());
                if request.dry_run {
                    return Ok(finish(report, tracker));
                }
                version
            }
            None => {
                tracker
                    .transition(PipelineState::CacheMiss)
                    .map_err(within(Component::Pipeline))?;
                info!("cache miss");

                // 3. Build
                checkpoint(ctx)?;
                let artifact = self
                    .builder
                    .build_snapshot(&snapshot)
                    .map_err(within(Component::ArtifactBuilder))?;
                tracker
                    .transition(PipelineState::Built)
                    .map_err(within(Component::Pipeline))?;
                report.artifact_sha256 = Some(artifact.sha256.clone());
                report.artifact_size = Some(artifact.size());
                if request.dry_run {
                    return Ok(finish(report, tracker));
                }

                // 4. Publish
                checkpoint(ctx)?;
                let outcome = Publisher::new(store, &self.retry)
                    .with_registry(registry())
                    .publish(&request.resource, &artifact, ctx)
                    .map_err(within(Component::Publisher))?;
                progress.version = Some(outcome.version.clone());
                progress.created = outcome.created;
                tracker
                    .transition(PipelineState::Published)
                    .map_err(within(Component::Pipeline))?;
                report.created = outcome.created;
                report.reused = !outcome.created;
                report.version = Some(outcome.version.clone());
                outcome.version
            }
        };

        // 5. Link
        tracker
            .transition(PipelineState::Linking)
            .map_err(within(Component::Pipeline))?;
        let linker = Linker::new(store, &self.retry);
        for consumer in &consumers {
            checkpoint(ctx)?;
            let link = linker
                .link(consumer, &version, ctx)
                .map_err(within(Component::Linker))?;
            progress.linked.push(consumer.clone());
            report.links.push(link);
        }
        tracker
            .transition(PipelineState::Linked)
            .map_err(within(Component::Pipeline))?;
        info!(
            version = version.version,
            consumers = consumers.len(),
            "pipeline complete"
        );

        Ok(finish(report, tracker))
    }
}

fn finish(mut report: PipelineReport, tracker: &StateTracker) -> PipelineReport {
    report.final_state = tracker.state();
    report.states = tracker.visited();
    report
}

fn dedup(consumers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    consumers
        .iter()
        .filter(|c| seen.insert(c.as_str()))
        .cloned()
        .collect()
}
