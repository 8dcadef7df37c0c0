//! Engine Configuration
//!
//! Settings are plain serde data so they can come from a JSON file or be
//! built in code:
//!
//! ```rust
//! use ripple_core::config::{EngineConfig, FlushMode};
//!
//! let config = EngineConfig::from_json(r#"{ "flush": "immediate" }"#).unwrap();
//! assert_eq!(config.flush, FlushMode::Immediate);
//! assert_eq!(config.label, "engine");
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// When a flush runs after a vertex is marked dirty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only on explicit `Engine::flush` calls.
    #[default]
    Manual,

    /// Synchronously, before the write returns.
    Immediate,

    /// On the current tokio `LocalSet`.
    LocalTask,
}

/// Engine settings. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub flush: FlushMode,

    /// Name used in log events and graph exports.
    pub label: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush: FlushMode::Manual,
            label: "engine".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_flush(mut self, flush: FlushMode) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine config: {0}")]
    Parse(#[from] serde_json::Error),
}
