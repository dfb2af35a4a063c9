use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Scope of the PC/SC context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextScope {
    User,
    #[default]
    System,
}

impl std::str::FromStr for ContextScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(ContextScope::User),
            "system" => Ok(ContextScope::System),
            _ => Err(format!("Invalid context scope: {s}")),
        }
    }
}

impl From<ContextScope> for pcsc::Scope {
    fn from(scope: ContextScope) -> Self {
        match scope {
            ContextScope::User => pcsc::Scope::User,
            ContextScope::System => pcsc::Scope::System,
        }
    }
}

/// Settings read from an optional JSON file, e.g.
///
/// ```json
/// { "scope": "user", "reader": "0", "transmit_timeout_ms": 2000 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub scope: ContextScope,
    /// Default reader name or index
    pub reader: Option<String>,
    pub transmit_timeout_ms: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        log::debug!("Loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Zero means no bound
    pub fn transmit_timeout(&self) -> Option<Duration> {
        self.transmit_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
