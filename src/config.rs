//! Engine settings
//!
//! Hierarchical configuration loading from:
//! - ruleflow.toml (checked-in defaults)
//! - ruleflow.local.toml (git-ignored local overrides)
//! - Environment variables (RULEFLOW_* prefix)
//!
//! ```toml
//! # ruleflow.toml
//! state_dir = "state"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! ```bash
//! RULEFLOW_STATE_DIR=/tmp/state
//! RULEFLOW_LOGGING__LEVEL=debug
//! ```
//!
//! These are engine defaults only; the `--dir` CLI flag overrides the
//! configured state directory per invocation.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory holding the journal and per-application work dirs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            state_dir: default_state_dir(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings from the default locations.
    ///
    /// Merges in order:
    /// 1. ruleflow.toml (base configuration)
    /// 2. ruleflow.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (RULEFLOW_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("ruleflow.toml"))
            .merge(Toml::file("ruleflow.local.toml"))
            .merge(Env::prefixed("RULEFLOW_").split("__"))
            .extract()
    }
}
