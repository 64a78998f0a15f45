//! Configuration loading
//!
//! Configuration is resolved in three passes: built-in defaults, an optional
//! `~/.underpass` YAML file, then environment variable overrides. Variables
//! are recognised with the `REPLICATOR_` prefix and the `UNDERPASS_` alias
//! (e.g. `REPLICATOR_UNDERPASS_DB_URL`, `UNDERPASS_FREQUENCY`).

use crate::config::schema::UnderpassConfig;
use crate::domain::{Result, UnderpassError};
use crate::replication::state::Frequency;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Load the configuration from defaults, the optional dotfile and the
/// environment
///
/// # Errors
///
/// Returns `UnderpassError::Configuration` if the dotfile cannot be parsed,
/// an override has an invalid value, or validation fails.
pub fn load_config() -> Result<UnderpassConfig> {
    let mut config = match dotfile_path() {
        Some(path) if path.exists() => load_dotfile(&path)?,
        _ => UnderpassConfig::default(),
    };

    apply_env_overrides(&mut config)?;

    config
        .validate()
        .map_err(|e| UnderpassError::Configuration(format!("Configuration validation failed: {e}")))?;

    Ok(config)
}

/// Location of the optional configuration dotfile
fn dotfile_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".underpass"))
}

/// Parse the `~/.underpass` YAML file
fn load_dotfile(path: &Path) -> Result<UnderpassConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        UnderpassError::Configuration(format!("Failed to read {}: {e}", path.display()))
    })?;
    serde_yaml::from_str(&contents).map_err(|e| {
        UnderpassError::Configuration(format!("Failed to parse {}: {e}", path.display()))
    })
}

/// Look up a variable under both accepted prefixes
fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("REPLICATOR_{suffix}"))
        .or_else(|_| std::env::var(format!("UNDERPASS_{suffix}")))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Apply environment variable overrides onto a loaded configuration
pub fn apply_env_overrides(config: &mut UnderpassConfig) -> Result<()> {
    if let Some(url) = env_var("UNDERPASS_DB_URL").or_else(|| env_var("DB_URL")) {
        config.underpass_db_url = url;
    }

    if let Some(schema) = env_var("DB_SCHEMA") {
        config.db_schema = schema;
    }

    if let Some(mut server) = env_var("PLANET_SERVER") {
        // Accept a full URL but store the bare domain.
        if let Some(stripped) = server.strip_prefix("https://") {
            server = stripped.to_string();
        }
        if let Some(stripped) = server.strip_suffix('/') {
            server = stripped.to_string();
        }
        config.planet_server = Some(server);
    }

    if let Some(datadir) = env_var("DATADIR") {
        config.datadir = datadir;
    }

    if let Some(freq) = env_var("FREQUENCY") {
        config.frequency = Frequency::from_str(&freq)
            .map_err(|e| UnderpassError::Configuration(format!("REPLICATOR_FREQUENCY: {e}")))?;
    }

    if let Some(concurrency) = env_var("CONCURRENCY") {
        config.concurrency = concurrency.parse().map_err(|_| {
            UnderpassError::Configuration(format!(
                "REPLICATOR_CONCURRENCY must be a positive integer, got '{concurrency}'"
            ))
        })?;
    }

    if let Some(boundary) = env_var("PRIORITY_BOUNDARY") {
        config.priority_boundary_file = Some(PathBuf::from(boundary));
    }

    if let Some(stats) = env_var("STATS_CONFIG") {
        config.stats_config_file = Some(PathBuf::from(stats));
    }

    if let Some(level) = env_var("LOG_LEVEL") {
        config.log_level = level;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment mutations are process wide, so the override checks run
    // inside a single test to avoid racing each other.
    #[test]
    fn test_env_overrides() {
        std::env::set_var("REPLICATOR_PLANET_SERVER", "https://mirror.example.org/");
        std::env::set_var("UNDERPASS_FREQUENCY", "hourly");
        std::env::set_var("REPLICATOR_CONCURRENCY", "2");

        let mut config = UnderpassConfig::default();
        apply_env_overrides(&mut config).unwrap();

        assert_eq!(config.planet_server.as_deref(), Some("mirror.example.org"));
        assert_eq!(config.frequency, Frequency::Hourly);
        assert_eq!(config.concurrency, 2);

        std::env::set_var("REPLICATOR_FREQUENCY", "fortnightly");
        let mut config = UnderpassConfig::default();
        assert!(apply_env_overrides(&mut config).is_err());

        std::env::remove_var("REPLICATOR_PLANET_SERVER");
        std::env::remove_var("UNDERPASS_FREQUENCY");
        std::env::remove_var("REPLICATOR_CONCURRENCY");
        std::env::remove_var("REPLICATOR_FREQUENCY");
    }
}
