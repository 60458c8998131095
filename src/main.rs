//! lambda-venv CLI
//!
//! Entry point for the `lambda-venv` command-line tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use lambda_venv::config::{EffectiveConfig, Settings};
use lambda_venv::credentials::{CredentialError, CredentialProvider, EnvCredentialProvider};
use lambda_venv::error::PipelineError;
use lambda_venv::pipeline::{Pipeline, RunRequest};
use lambda_venv::registry::VersionRegistry;
use lambda_venv::retry::{CallContext, CancelToken};
use lambda_venv::signal::SignalHandler;
use lambda_venv::store::DirStore;
use lambda_venv::tree::{locate_venv, site_packages, VenvSources};
use lambda_venv::TreeFingerprint;

#[derive(Parser)]
#[command(name = "lambda-venv")]
#[command(about = "Package a Python virtualenv as a layer and publish it idempotently", version)]
struct Cli {
    /// Log filter (e.g. info, debug, lambda_venv=trace); defaults to RUST_LOG or warn
    #[arg(long, global = true)]
    loglevel: Option<String>,

    /// Run as if started in this directory
    #[arg(short = 'C', long = "cwd", global = true)]
    cwd: Option<PathBuf>,

    /// Config file (default: ./lambda-venv.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Virtualenv to package
    #[arg(short = 'e', long, global = true)]
    venv: Option<PathBuf>,

    /// Package this directory as-is instead of a virtualenv's site-packages
    #[arg(long, global = true)]
    tree: Option<PathBuf>,

    /// Store root directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Single-line JSON output
    #[arg(short = 'c', long, global = true)]
    compact: bool,

    /// Print string results as-is instead of JSON-quoted
    #[arg(short = 'r', long, global = true)]
    raw: bool,

    /// Show the full error chain on failure
    #[arg(long, visible_alias = "tb", global = true)]
    traceback: bool,

    /// Write the result JSON to a file instead of stdout
    #[arg(short = 'o', long, global = true)]
    output: Option<PathBuf>,

    /// Overall timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tool version (a JSON string; use -r for raw)
    Version,

    /// Compute the content fingerprint of the packaged tree
    Fingerprint,

    /// Build the artifact locally without publishing
    Build {
        /// Archive destination
        #[arg(long)]
        out: PathBuf,

        /// Also write the artifact manifest here
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Publish the tree (unless already published) and link consumers
    Publish {
        /// Resource name (overrides layer.name)
        #[arg(long)]
        resource: Option<String>,

        /// Consumer to link; repeatable (replaces configured consumers)
        #[arg(long = "consumer")]
        consumers: Vec<String>,

        /// Stop before uploading anything
        #[arg(long)]
        dry_run: bool,

        /// Create missing consumers in the store first
        #[arg(long)]
        create_consumers: bool,
    },

    /// List the published versions of a resource
    Versions {
        /// Resource name (overrides layer.name)
        #[arg(long)]
        resource: Option<String>,
    },
}

/// Result of a command: JSON to emit and the exit code
type Outcome = Result<(Value, i32), PipelineError>;

fn main() {
    let cli = Cli::parse();

    let filter = match &cli.loglevel {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match resolve_cwd(cli.cwd.as_deref()) {
        Ok(cwd) => dispatch(&cli, &cwd),
        Err(e) => Err(e),
    };

    match result {
        Ok((value, code)) => {
            if let Err(e) = emit(&value, cli.compact, cli.raw, cli.output.as_deref()) {
                eprintln!("Error writing output: {}", e);
                process::exit(e.exit_code());
            }
            process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if cli.traceback {
                print_chain(&e);
            }
            process::exit(e.exit_code());
        }
    }
}

/// Print the source chain and debug form of `err` to stderr
fn print_chain(err: &dyn std::error::Error) {
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
    eprintln!("{:#?}", err);
}

fn resolve_cwd(cwd: Option<&Path>) -> Result<PathBuf, PipelineError> {
    let current = std::env::current_dir()?;
    Ok(match cwd {
        Some(dir) => current.join(dir),
        None => current,
    })
}

fn dispatch(cli: &Cli, cwd: &Path) -> Outcome {
    match &cli.command {
        Commands::Version => Ok((json!(env!("CARGO_PKG_VERSION")), 0)),
        Commands::Fingerprint => run_fingerprint(cli, cwd),
        Commands::Build { out, manifest } => run_build(cli, cwd, out, manifest.as_deref()),
        Commands::Publish {
            resource,
            consumers,
            dry_run,
            create_consumers,
        } => run_publish(
            cli,
            cwd,
            resource.as_deref(),
            consumers,
            *dry_run,
            *create_consumers,
        ),
        Commands::Versions { resource } => run_versions(cli, cwd, resource.as_deref()),
    }
}

/// CLI flags as the top configuration layer
fn cli_overrides(cli: &Cli, resource: Option<&str>, consumers: &[String]) -> Value {
    let mut overrides = json!({});
    if let Some(store) = &cli.store {
        overrides["store"] = json!({"root": store});
    }
    if let Some(timeout) = cli.timeout {
        overrides["timeouts"] = json!({"overall_seconds": timeout});
    }
    if let Some(resource) = resource {
        overrides["layer"] = json!({"name": resource});
    }
    if !consumers.is_empty() {
        overrides["consumers"] = json!(consumers);
    }
    overrides
}

fn load_settings(
    cli: &Cli,
    cwd: &Path,
    resource: Option<&str>,
    consumers: &[String],
) -> Result<Settings, PipelineError> {
    let config = EffectiveConfig::build(
        cwd,
        cli.config.as_deref(),
        Some(cli_overrides(cli, resource, consumers)),
    )?;
    Ok(config.settings)
}

/// The directory that gets packaged
fn resolve_tree(cli: &Cli, cwd: &Path, settings: &Settings) -> Result<PathBuf, PipelineError> {
    if let Some(tree) = &cli.tree {
        return Ok(cwd.join(tree));
    }
    let sources = VenvSources {
        cli: cli.venv.clone(),
        config: settings.layer.venv.clone(),
        virtual_env: std::env::var_os("VIRTUAL_ENV")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
    };
    let venv = locate_venv(cwd, &sources)?;
    Ok(site_packages(&venv)?)
}

fn require_resource(settings: &Settings) -> Result<String, PipelineError> {
    settings.layer.name.clone().ok_or_else(|| {
        PipelineError::Usage("no resource name: pass --resource or set layer.name".to_string())
    })
}

fn open_store(
    cwd: &Path,
    settings: &Settings,
    principal: Option<String>,
    ctx: &CallContext,
) -> Result<DirStore, PipelineError> {
    let mut store = DirStore::open(settings.store_root(cwd), settings.layer.kind)?;
    if let Some(principal) = principal {
        store = store.with_principal(principal);
    }
    if let Some(deadline) = ctx.deadline() {
        store = store.with_deadline(deadline);
    }
    Ok(store)
}

fn call_context(settings: &Settings) -> Result<CallContext, PipelineError> {
    let token = CancelToken::new();
    SignalHandler::new(token.clone())
        .install()
        .map_err(|e| PipelineError::Usage(format!("cannot install signal handler: {}", e)))?;
    Ok(CallContext::new()
        .with_cancel_token(token)
        .with_timeout(settings.overall_timeout()))
}

fn run_fingerprint(cli: &Cli, cwd: &Path) -> Outcome {
    let settings = load_settings(cli, cwd, None, &[])?;
    let tree = resolve_tree(cli, cwd, &settings)?;
    let snapshot = settings.scan_options().scanner(&tree).scan()?;
    let fingerprint = TreeFingerprint::of_snapshot(&snapshot);

    Ok((
        json!({
            "tree": tree,
            "fingerprint": fingerprint,
            "file_count": snapshot.file_count(),
            "total_size": snapshot.total_size,
        }),
        0,
    ))
}

fn run_build(cli: &Cli, cwd: &Path, out: &Path, manifest: Option<&Path>) -> Outcome {
    let settings = load_settings(cli, cwd, None, &[])?;
    let tree = resolve_tree(cli, cwd, &settings)?;
    let scanner = settings.scan_options().scanner(&tree);
    let artifact = settings.artifact_builder().build(&scanner)?;

    let out = cwd.join(out);
    artifact.write_to(&out)?;
    let manifest = manifest.map(|m| cwd.join(m));
    if let Some(path) = &manifest {
        artifact.write_manifest(path)?;
    }

    Ok((
        json!({
            "tree": tree,
            "out": out,
            "manifest": manifest,
            "fingerprint": artifact.fingerprint,
            "sha256": artifact.sha256,
            "size": artifact.size(),
            "uncompressed_size": artifact.uncompressed_size,
            "file_count": artifact.file_count,
        }),
        0,
    ))
}

fn run_publish(
    cli: &Cli,
    cwd: &Path,
    resource: Option<&str>,
    consumers: &[String],
    dry_run: bool,
    create_consumers: bool,
) -> Outcome {
    let settings = load_settings(cli, cwd, resource, consumers)?;
    let resource = require_resource(&settings)?;
    let tree = resolve_tree(cli, cwd, &settings)?;

    let target = settings.credentials.target_account.as_deref();
    let principal = match EnvCredentialProvider::from_env().get_credentials(target) {
        Ok(creds) => creds.principal,
        Err(CredentialError::NotFound(_)) if target.is_none() => None,
        Err(e) => return Err(e.into()),
    };

    let ctx = call_context(&settings)?;
    let store = open_store(cwd, &settings, principal, &ctx)?;
    if create_consumers && !dry_run {
        for consumer in &settings.consumers {
            store.create_consumer(consumer)?;
        }
    }

    let pipeline = Pipeline::new(std::sync::Arc::new(store))
        .with_retry_policy(settings.retry_policy())
        .with_scan_options(settings.scan_options())
        .with_builder(settings.artifact_builder())
        .with_page_size(settings.store.page_size);
    let request = RunRequest {
        tree_root: tree,
        resource,
        consumers: settings.consumers.clone(),
        dry_run,
    };

    match pipeline.run(&request, &ctx) {
        Ok(report) => Ok((serde_json::to_value(&report)?, 0)),
        Err(failure) => {
            eprintln!("Error: {}", failure);
            if cli.traceback {
                print_chain(&failure);
            }
            Ok((failure.to_json(), failure.exit_code()))
        }
    }
}

fn run_versions(cli: &Cli, cwd: &Path, resource: Option<&str>) -> Outcome {
    let settings = load_settings(cli, cwd, resource, &[])?;
    let resource = require_resource(&settings)?;
    let ctx = call_context(&settings)?;
    let store = open_store(cwd, &settings, None, &ctx)?;
    let retry = settings.retry_policy();

    let versions = VersionRegistry::new(&store, &retry)
        .with_page_size(settings.store.page_size)
        .list(&resource, &ctx)?;

    Ok((json!({"resource": resource, "versions": versions}), 0))
}

/// Text written for a command result
///
/// With `raw`, a top-level string is written without JSON quoting; values
/// nested in objects are unaffected.
fn render(value: &Value, compact: bool, raw: bool) -> Result<String, serde_json::Error> {
    let mut text = match value {
        Value::String(s) if raw => s.clone(),
        _ if compact => serde_json::to_string(value)?,
        _ => serde_json::to_string_pretty(value)?,
    };
    text.push('\n');
    Ok(text)
}

fn emit(
    value: &Value,
    compact: bool,
    raw: bool,
    output: Option<&Path>,
) -> Result<(), PipelineError> {
    let text = render(value, compact, raw)?;
    match output {
        Some(path) => fs::write(path, text)?,
        None => print!("{}", text),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_json_string() {
        let cli = Cli::parse_from(["lambda-venv", "version"]);
        let (value, code) = dispatch(&cli, Path::new(".")).unwrap();
        assert_eq!(code, 0);
        assert_eq!(value, Value::String(env!("CARGO_PKG_VERSION").to_string()));
        assert_eq!(
            render(&value, false, false).unwrap(),
            format!("\"{}\"\n", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn test_raw_only_unquotes_top_level_strings() {
        assert_eq!(render(&json!("1.2.3"), false, true).unwrap(), "1.2.3\n");
        assert_eq!(
            render(&json!({"version": "1.2.3"}), true, true).unwrap(),
            "{\"version\":\"1.2.3\"}\n"
        );
    }

    #[test]
    fn test_global_flags_parse() {
        let cli = Cli::parse_from(["lambda-venv", "-r", "--tb", "-c", "version"]);
        assert!(cli.raw);
        assert!(cli.traceback);
        assert!(cli.compact);

        let cli = Cli::parse_from(["lambda-venv", "version", "--raw", "--traceback"]);
        assert!(cli.raw);
        assert!(cli.traceback);
    }
}
