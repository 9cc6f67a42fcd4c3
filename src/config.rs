use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{bridge::BridgeOptions, error::ConfigError, transport::PtyOptions};

/// Tunables for one deployment. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    pub pty: PtyOptions,
    /// Deadline for one remote command. Unset means wait as long as it takes.
    pub command_timeout_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    /// Depth bound for folder-tree walks below home.
    pub tree_max_depth: Option<u32>,
    pub bridge: BridgeOptions,
}

impl Default for TuneConfig {
    fn default() -> Self {
        TuneConfig {
            pty: PtyOptions::default(),
            command_timeout_secs: None,
            connect_timeout_secs: 10,
            tree_max_depth: None,
            bridge: BridgeOptions::default(),
        }
    }
}

impl TuneConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<TuneConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        TuneConfig::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<TuneConfig, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
