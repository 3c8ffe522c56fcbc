//! Key configuration.
//!
//! A single JSON document supplies per-provider OAuth application keys:
//!
//! ```json
//! { "keys": { "dropbox": { "client_id": "...", "client_secret": "..." } } }
//! ```
//!
//! Hints passed at handle creation override any of these values.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// OAuth application keys for one provider kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderKeys {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-provider application keys, keyed by wire name.
    #[serde(default)]
    pub keys: HashMap<String, ProviderKeys>,
}

impl Config {
    /// Loads configuration from a JSON file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Parses configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Looks up the keys for a provider wire name.
    pub fn keys_for(&self, kind: &str) -> Option<&ProviderKeys> {
        self.keys.get(kind)
    }
}
