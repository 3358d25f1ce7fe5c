//! Configuration loader for rankguard.
//!
//! Reads `config.toml` from the data directory (`~/.rankguard/` in
//! production) and deserializes it into [`PermsConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::Path;

use rankguard_types::config::PermsConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`PermsConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub fn load_config(data_dir: &Path) -> PermsConfig {
    let config_path = data_dir.join("config.toml");

    let content = match std::fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return PermsConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return PermsConfig::default();
        }
    };

    match toml::from_str::<PermsConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            PermsConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rankguard_types::backend::BackendKind;
    use rankguard_types::user::IdentityMode;
    use tempfile::TempDir;

    #[test]
    fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path());
        assert_eq!(config.backend, BackendKind::Yaml);
        assert_eq!(config.cleanup_interval_secs, 1800);
    }

    #[test]
    fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            r#"
identity_mode = "name"
backend = "json"
use_regex_perms = true
persist_retries = 5
"#,
        )
        .unwrap();

        let config = load_config(tmp.path());
        assert_eq!(config.identity_mode, IdentityMode::Name);
        assert_eq!(config.backend, BackendKind::Json);
        assert!(config.use_regex_perms);
        assert_eq!(config.persist_retries, 5);
    }

    #[test]
    fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "backend = [not valid").unwrap();

        let config = load_config(tmp.path());
        assert_eq!(config.backend, BackendKind::Yaml);
        assert!(!config.use_regex_perms);
    }
}
