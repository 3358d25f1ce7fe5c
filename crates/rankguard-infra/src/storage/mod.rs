//! Storage backends.
//!
//! Implements the `Backend` and `BackendFactory` traits from
//! `rankguard-core`. Every backend stores the same serde shape of `Group`
//! and `User`, so data can be migrated between them without conversion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rankguard_core::repository::{Backend, BackendFactory};
use rankguard_types::backend::BackendKind;
use rankguard_types::error::BackendError;
use rankguard_types::user::IdentityMode;

pub mod json;
pub mod memory;
pub mod yaml;

pub use json::JsonBackend;
pub use memory::MemoryBackend;
pub use yaml::YamlBackend;

/// File name of the YAML document inside the data directory.
pub const YAML_FILE: &str = "permissions.yml";

/// Directory of the JSON backend inside the data directory.
pub const JSON_DIR: &str = "json";

/// Builds backends rooted at one data directory.
#[derive(Debug, Clone)]
pub struct StorageFactory {
    data_dir: PathBuf,
    mode: IdentityMode,
}

impl StorageFactory {
    pub fn new(data_dir: PathBuf, mode: IdentityMode) -> Self {
        Self { data_dir, mode }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl BackendFactory for StorageFactory {
    fn create(&self, kind: BackendKind) -> Result<Arc<dyn Backend>, BackendError> {
        tracing::debug!(kind = %kind, data_dir = %self.data_dir.display(), "creating backend");
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::Yaml => Arc::new(YamlBackend::open(self.data_dir.join(YAML_FILE), self.mode)?),
            BackendKind::Json => Arc::new(JsonBackend::open(self.data_dir.join(JSON_DIR), self.mode)?),
            BackendKind::Memory => Arc::new(MemoryBackend::new(self.mode)),
        };
        Ok(backend)
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `RANKGUARD_DATA_DIR` environment variable
/// 2. `~/.rankguard` in the user's home directory
/// 3. `.rankguard` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RANKGUARD_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".rankguard");
    }

    PathBuf::from(".rankguard")
}

/// Replace `path` with `contents` via a temporary sibling and a rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// File-name-safe form of a storage key.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes
/// `%XX`, so distinct keys never collide.
pub(crate) fn file_stem(key: &str) -> String {
    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}
