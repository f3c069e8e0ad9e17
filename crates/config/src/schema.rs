//! Root config schema.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root configuration.
///
/// Workspace entries stay untyped here; each one is parsed by the chat
/// backend that owns it, the same way it arrives over `start_account`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkiffConfig {
    /// Connected workspaces, keyed by a local workspace name.
    pub workspaces: HashMap<String, serde_json::Value>,
    pub log: LogConfig,
}

/// Logging defaults, overridable from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl SkiffConfig {
    /// Names of configured workspaces, sorted for stable startup order.
    pub fn workspace_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workspaces.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
