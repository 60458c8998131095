//! Effective configuration with provenance
//!
//! Merges the layers, deserializes the result into typed `Settings` and
//! validates it. Records where each contributing layer came from.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex_lite::Regex;
use tracing::debug;

use lambda_venv_store::{ResourceKind, MAX_PAGE_SIZE};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;
use crate::bundle::ArtifactBuilder;
use crate::pipeline::ScanOptions;
use crate::retry::RetryPolicy;

/// Config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "lambda-venv.toml";

const NAME_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";
const ACCOUNT_PATTERN: &str = r"^\d{12}$";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// `[layer]`: what is published and how it is packed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSettings {
    /// Resource name; required to publish
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ResourceKind,
    /// Archive prefix, empty for none
    pub prefix: String,
    /// 0 disables the limit
    pub max_uncompressed_bytes: u64,
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Relative to the packaged tree, empty for none
    #[serde(default)]
    pub ignore_file: String,
    #[serde(default)]
    pub venv: Option<PathBuf>,
}

/// `[store]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    pub root: PathBuf,
    pub page_size: usize,
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// `[timeouts]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    pub overall_seconds: u64,
}

/// `[credentials]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialSettings {
    #[serde(default)]
    pub target_account: Option<String>,
}

/// Typed, validated configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub layer: LayerSettings,
    pub store: StoreSettings,
    pub retry: RetrySettings,
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    #[serde(default)]
    pub consumers: Vec<String>,
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_delays(
                Duration::from_millis(self.retry.initial_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.overall_seconds)
    }

    /// Store root, relative paths resolved against `cwd`
    pub fn store_root(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.store.root)
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            prefix: Some(self.layer.prefix.clone()),
            excludes: self.layer.excludes.clone(),
            ignore_file: (!self.layer.ignore_file.is_empty())
                .then(|| PathBuf::from(&self.layer.ignore_file)),
        }
    }

    pub fn artifact_builder(&self) -> ArtifactBuilder {
        ArtifactBuilder::new().with_max_uncompressed_bytes(self.layer.max_uncompressed_bytes)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name_re = compile(NAME_PATTERN)?;
        let account_re = compile(ACCOUNT_PATTERN)?;

        if let Some(name) = &self.layer.name {
            if !name_re.is_match(name) {
                return Err(ConfigError::ValidationError(format!(
                    "layer.name {:?} must match {}",
                    name, NAME_PATTERN
                )));
            }
        }
        for consumer in &self.consumers {
            if !name_re.is_match(consumer) {
                return Err(ConfigError::ValidationError(format!(
                    "consumer {:?} must match {}",
                    consumer, NAME_PATTERN
                )));
            }
        }
        if let Some(account) = &self.credentials.target_account {
            if !account_re.is_match(account) {
                return Err(ConfigError::ValidationError(format!(
                    "credentials.target_account {:?} must be 12 digits",
                    account
                )));
            }
        }

        if !(1..=MAX_PAGE_SIZE).contains(&self.store.page_size) {
            return Err(ConfigError::ValidationError(format!(
                "store.page_size must be in [1, {}]",
                MAX_PAGE_SIZE
            )));
        }
        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be in [1, 10]".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.timeouts.overall_seconds == 0 || self.timeouts.overall_seconds > 86400 {
            return Err(ConfigError::ValidationError(
                "timeouts.overall_seconds must be in (0, 86400]".to_string(),
            ));
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::ValidationError(e.to_string()))
}

/// Merged settings plus the layers they came from
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub settings: Settings,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,
}

impl EffectiveConfig {
    /// Build from defaults, a config file and CLI overrides
    ///
    /// `config_path` must exist when given. Without it,
    /// `lambda-venv.toml` in `cwd` is used if present.
    pub fn build(
        cwd: &Path,
        config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        layers.push(BuiltinDefaults::default().to_value());
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        let file = match config_path {
            Some(path) => Some(cwd.join(path)),
            None => Some(cwd.join(CONFIG_FILE_NAME)).filter(|p| p.is_file()),
        };
        if let Some(path) = file {
            let (value, digest) = Self::load_toml_file(&path)?;
            debug!(path = %path.display(), "config file loaded");
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let settings: Settings = serde_json::from_value(merged)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;

        Ok(Self { settings, sources })
    }

    /// Load and parse a TOML file, returning the value and digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
        let toml_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        Ok((Self::toml_to_json(toml_value), digest))
    }

    /// Convert TOML Value to JSON Value
    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Self::toml_to_json).collect())
            }
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn build(cli: Value) -> Result<EffectiveConfig, ConfigError> {
        let dir = TempDir::new().unwrap();
        EffectiveConfig::build(dir.path(), None, Some(cli))
    }

    #[test]
    fn test_defaults_only() {
        let dir = TempDir::new().unwrap();
        let config = EffectiveConfig::build(dir.path(), None, None).unwrap();
        let settings = &config.settings;

        assert_eq!(settings.layer.name, None);
        assert_eq!(settings.layer.kind, ResourceKind::Layer);
        assert_eq!(settings.layer.prefix, "python");
        assert_eq!(settings.store.page_size, 50);
        assert_eq!(settings.overall_timeout(), Duration::from_secs(900));
        assert_eq!(settings.retry_policy().max_attempts, 4);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_file_in_cwd_then_cli() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
consumers = ["func-1", "func-2"]

[layer]
name = "deps"
kind = "code_bundle"
excludes = ["tests/"]

[retry]
max_attempts = 6
"#,
        )
        .unwrap();

        let cli = json!({"consumers": ["func-3"], "retry": {"initial_delay_ms": 0}});
        let config = EffectiveConfig::build(dir.path(), None, Some(cli)).unwrap();
        let settings = &config.settings;

        assert_eq!(settings.layer.name.as_deref(), Some("deps"));
        assert_eq!(settings.layer.kind, ResourceKind::CodeBundle);
        assert_eq!(settings.layer.excludes, vec!["tests/"]);
        assert_eq!(settings.consumers, vec!["func-3"]);
        assert_eq!(settings.retry.max_attempts, 6);
        assert_eq!(settings.retry.initial_delay_ms, 0);
        assert_eq!(settings.retry.max_delay_ms, 8000);

        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[1].origin, ConfigOrigin::File);
        assert_eq!(config.sources[1].digest.as_ref().unwrap().len(), 64);
        assert_eq!(config.sources[2].origin, ConfigOrigin::Cli);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = TempDir::new().unwrap();
        let err =
            EffectiveConfig::build(dir.path(), Some(Path::new("missing.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.toml"), "[layer\nname = ").unwrap();
        let err =
            EffectiveConfig::build(dir.path(), Some(Path::new("bad.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = build(json!({"store": {"bucket": "x"}})).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = build(json!({"layer": {"kind": "container"}})).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_validation() {
        let cases = [
            (json!({"layer": {"name": "has space"}}), "layer.name"),
            (json!({"consumers": ["ok", "bad/slash"]}), "consumer"),
            (json!({"credentials": {"target_account": "12345"}}), "target_account"),
            (json!({"store": {"page_size": 0}}), "page_size"),
            (json!({"store": {"page_size": 51}}), "page_size"),
            (json!({"retry": {"max_attempts": 11}}), "max_attempts"),
            (json!({"retry": {"initial_delay_ms": 9000}}), "initial_delay_ms"),
            (json!({"timeouts": {"overall_seconds": 0}}), "overall_seconds"),
            (json!({"timeouts": {"overall_seconds": 86401}}), "overall_seconds"),
        ];
        for (cli, needle) in cases {
            match build(cli.clone()) {
                Err(ConfigError::ValidationError(msg)) => {
                    assert!(msg.contains(needle), "{} for {}", msg, cli)
                }
                other => panic!("Expected ValidationError for {}, got {:?}", cli, other),
            }
        }
    }

    #[test]
    fn test_scan_options_and_builder() {
        let config = build(json!({"layer": {"prefix": "", "ignore_file": ""}})).unwrap();
        let scan = config.settings.scan_options();
        assert_eq!(scan.prefix.as_deref(), Some(""));
        assert!(scan.ignore_file.is_none());

        let config = build(json!({})).unwrap();
        assert_eq!(
            config.settings.scan_options().ignore_file,
            Some(PathBuf::from(".layerignore"))
        );
    }

    #[test]
    fn test_store_root_relative_to_cwd() {
        let config = build(json!({})).unwrap();
        assert_eq!(
            config.settings.store_root(Path::new("/work")),
            PathBuf::from("/work/.lambda-venv/store")
        );

        let config = build(json!({"store": {"root": "/srv/store"}})).unwrap();
        assert_eq!(
            config.settings.store_root(Path::new("/work")),
            PathBuf::from("/srv/store")
        );
    }
}
