//! Built-in defaults (first layer)

use serde::{Deserialize, Serialize};

use crate::bundle::DEFAULT_MAX_UNCOMPRESSED_BYTES;

pub const DEFAULT_PREFIX: &str = "python";
pub const DEFAULT_IGNORE_FILE: &str = ".layerignore";
pub const DEFAULT_STORE_ROOT: &str = ".lambda-venv/store";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    pub kind: String,
    pub prefix: String,
    pub max_uncompressed_bytes: u64,
    pub ignore_file: String,
    pub store_root: String,
    pub page_size: usize,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Overall timeout in seconds (default: 900 = 15 minutes)
    pub overall_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            kind: "layer".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            max_uncompressed_bytes: DEFAULT_MAX_UNCOMPRESSED_BYTES,
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            store_root: DEFAULT_STORE_ROOT.to_string(),
            page_size: 50,
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 8000,
            overall_seconds: 900,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "layer": {
                "kind": self.kind,
                "prefix": self.prefix,
                "max_uncompressed_bytes": self.max_uncompressed_bytes,
                "excludes": [],
                "ignore_file": self.ignore_file
            },
            "store": {
                "root": self.store_root,
                "page_size": self.page_size
            },
            "retry": {
                "max_attempts": self.max_attempts,
                "initial_delay_ms": self.initial_delay_ms,
                "max_delay_ms": self.max_delay_ms
            },
            "timeouts": {
                "overall_seconds": self.overall_seconds
            },
            "credentials": {},
            "consumers": []
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();

        assert_eq!(value["layer"]["kind"], "layer");
        assert_eq!(value["layer"]["prefix"], "python");
        assert_eq!(value["layer"]["max_uncompressed_bytes"], 262_144_000u64);
        assert_eq!(value["store"]["page_size"], 50);
        assert_eq!(value["retry"]["max_delay_ms"], 8000);
        assert_eq!(value["timeouts"]["overall_seconds"], 900);
        assert!(value["layer"].get("name").is_none());
    }
}
