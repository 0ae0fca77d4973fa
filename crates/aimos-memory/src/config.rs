//! Configuration loading from `~/.aimos/config.toml` with defaults.
//!
//! Environment overrides (`CMC_BACKEND`, `AIMOS_STORE_DIR`) are applied on
//! top of the file.

use aimos_types::config::{default_home_dir, AimosConfig, Backend, BACKEND_ENV, STORE_DIR_ENV};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn default_config_path() -> PathBuf {
    default_home_dir().join("config.toml")
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file is missing or unreadable, then apply environment overrides.
pub fn load_config(path: Option<&Path>) -> AimosConfig {
    let mut config = read_config_file(path);
    apply_env_overrides(
        &mut config,
        std::env::var(BACKEND_ENV).ok(),
        std::env::var(STORE_DIR_ENV).ok(),
    );
    config
}

fn read_config_file(path: Option<&Path>) -> AimosConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return AimosConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<AimosConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                AimosConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            AimosConfig::default()
        }
    }
}

/// Apply raw override values. Unknown backends are ignored with a warning.
pub fn apply_env_overrides(config: &mut AimosConfig, backend: Option<String>, store_dir: Option<String>) {
    if let Some(raw) = backend.filter(|b| !b.trim().is_empty()) {
        match raw.parse::<Backend>() {
            Ok(backend) => config.store.backend = backend,
            Err(e) => warn!(error = %e, "Ignoring {BACKEND_ENV}"),
        }
    }
    if let Some(dir) = store_dir.filter(|d| !d.trim().is_empty()) {
        config.store.dir = PathBuf::from(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_config_file(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.store.backend, Backend::Sqlite);
    }

    #[test]
    fn test_file_values_and_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("config.toml");
        std::fs::write(&good, "[store]\nbackend = \"jsonl\"\nbusy_timeout_ms = 10\n").unwrap();
        let config = read_config_file(Some(&good));
        assert_eq!(config.store.backend, Backend::Jsonl);
        assert_eq!(config.store.busy_timeout_ms, 10);

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[store\nbackend =").unwrap();
        assert_eq!(read_config_file(Some(&bad)).store.backend, Backend::Sqlite);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AimosConfig::default();
        apply_env_overrides(&mut config, Some("journal".into()), Some("/tmp/aimos".into()));
        assert_eq!(config.store.backend, Backend::Jsonl);
        assert_eq!(config.store.dir, PathBuf::from("/tmp/aimos"));

        apply_env_overrides(&mut config, Some("oracle".into()), Some("  ".into()));
        assert_eq!(config.store.backend, Backend::Jsonl);
        assert_eq!(config.store.dir, PathBuf::from("/tmp/aimos"));
    }
}
