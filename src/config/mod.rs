//! Configuration merge system
//!
//! Three layers, later ones winning:
//! 1. Built-in defaults
//! 2. Config file (`--config` or `./lambda-venv.toml`)
//! 3. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::BuiltinDefaults;
pub use effective::{
    ConfigError, ConfigOrigin, ConfigSource, CredentialSettings, EffectiveConfig, LayerSettings,
    RetrySettings, Settings, StoreSettings, TimeoutSettings, CONFIG_FILE_NAME,
};
pub use merge::{deep_merge, merge_layers};
