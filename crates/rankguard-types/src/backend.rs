use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage technology behind a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Single YAML document holding every group and user.
    #[default]
    Yaml,
    /// One JSON file per group and per user.
    Json,
    /// Process memory only; nothing survives a restart.
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Yaml => write!(f, "yaml"),
            BackendKind::Json => write!(f, "json"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(BackendKind::Yaml),
            "json" => Ok(BackendKind::Json),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("invalid backend kind: '{other}'")),
        }
    }
}
