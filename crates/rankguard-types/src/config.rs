//! Configuration types for rankguard.
//!
//! `PermsConfig` represents the top-level `config.toml` that selects the
//! identity mode, the storage backend, the matching strategy and the timing
//! of background work.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::user::IdentityMode;

/// Top-level configuration for a rankguard instance.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermsConfig {
    /// Whether users are keyed by id or by name.
    #[serde(default)]
    pub identity_mode: IdentityMode,

    /// Storage technology of the active backend.
    #[serde(default)]
    pub backend: BackendKind,

    /// Match permission entries as regular expressions instead of wildcards.
    #[serde(default)]
    pub use_regex_perms: bool,

    /// Seconds between two runs of the cache cleanup task.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Token attached to outgoing network notifications so this instance can
    /// recognize its own echoes.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Extra attempts for a failed backend write before giving up.
    #[serde(default = "default_persist_retries")]
    pub persist_retries: usize,

    /// Delay between two backend write attempts, in milliseconds.
    #[serde(default = "default_persist_retry_delay_ms")]
    pub persist_retry_delay_ms: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    1800
}

fn default_origin() -> String {
    Uuid::now_v7().to_string()
}

fn default_persist_retries() -> usize {
    2
}

fn default_persist_retry_delay_ms() -> u64 {
    50
}

impl PermsConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn persist_retry_delay(&self) -> Duration {
        Duration::from_millis(self.persist_retry_delay_ms)
    }
}

impl Default for PermsConfig {
    fn default() -> Self {
        Self {
            identity_mode: IdentityMode::default(),
            backend: BackendKind::default(),
            use_regex_perms: false,
            cleanup_interval_secs: default_cleanup_interval_secs(),
            origin: default_origin(),
            persist_retries: default_persist_retries(),
            persist_retry_delay_ms: default_persist_retry_delay_ms(),
        }
    }
}
