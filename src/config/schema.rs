//! Configuration schema types
//!
//! The typed configuration record initialised at startup and passed by
//! reference into every component; there are no ambient mutable singletons.

use crate::replication::state::Frequency;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A planet replication server with its supported frequencies
///
/// Servers are tried in list order; a server that does not carry the
/// requested frequency is skipped during failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanetServer {
    /// Domain part, without the scheme (e.g. "planet.openstreetmap.org")
    pub domain: String,

    /// Data directory under the domain, usually "replication"
    #[serde(default = "default_datadir")]
    pub datadir: String,

    /// Serves daily diffs
    #[serde(default = "default_true")]
    pub has_daily: bool,

    /// Serves hourly diffs
    #[serde(default = "default_true")]
    pub has_hourly: bool,

    /// Serves minutely diffs
    #[serde(default = "default_true")]
    pub has_minutely: bool,

    /// Serves the changeset stream
    #[serde(default = "default_true")]
    pub has_changeset: bool,
}

impl PlanetServer {
    /// Create a server entry supporting every stream
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            datadir: default_datadir(),
            has_daily: true,
            has_hourly: true,
            has_minutely: true,
            has_changeset: true,
        }
    }

    /// Returns true if the given frequency is supported by this server
    pub fn has_frequency(&self, frequency: Frequency) -> bool {
        match frequency {
            Frequency::Daily => self.has_daily,
            Frequency::Hourly => self.has_hourly,
            Frequency::Minutely => self.has_minutely,
        }
    }

    /// Full base URL including the datadir
    /// (e.g. "https://planet.openstreetmap.org/replication")
    pub fn replication_url(&self) -> String {
        if self.datadir.is_empty() {
            format!("https://{}", self.domain)
        } else {
            format!("https://{}/{}", self.domain, self.datadir)
        }
    }
}

/// Retry and polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base poll interval in seconds when the next file is not there yet
    #[serde(default = "default_min_poll_interval")]
    pub min_poll_interval_secs: u64,

    /// Multiplier applied per consecutive empty poll
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on the poll interval in seconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_secs: u64,

    /// Polling past the last known sequence for longer than this is
    /// reported as a gap
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold_secs: u64,

    /// Maximum download attempts across the server list for one file
    #[serde(default = "default_max_http_retries")]
    pub max_http_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_secs: default_min_poll_interval(),
            backoff_factor: default_backoff_factor(),
            max_poll_interval_secs: default_max_poll_interval(),
            gap_threshold_secs: default_gap_threshold(),
            max_http_retries: default_max_http_retries(),
        }
    }
}

/// HTTP timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,

    /// Total request timeout in seconds
    #[serde(default = "default_total_timeout")]
    pub total_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            total_secs: default_total_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Write logs to a file in addition to the console
    #[serde(default = "default_true")]
    pub file_enabled: bool,

    /// Log file path
    #[serde(default = "default_log_file")]
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_enabled: true,
            file_path: default_log_file(),
        }
    }
}

/// Main Underpass configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderpassConfig {
    /// PostgreSQL connection string or URL for the underpass database
    #[serde(default = "default_db_url")]
    pub underpass_db_url: String,

    /// Schema the emitter writes into
    #[serde(default = "default_db_schema")]
    pub db_schema: String,

    /// Explicit planet server (domain), overriding the server list
    #[serde(default)]
    pub planet_server: Option<String>,

    /// Known planet servers, tried in order
    #[serde(default = "default_planet_servers")]
    pub planet_servers: Vec<PlanetServer>,

    /// Data directory on the planet server
    #[serde(default = "default_datadir")]
    pub datadir: String,

    /// Replication frequency for the osmChange stream
    #[serde(default)]
    pub frequency: Frequency,

    /// Worker pool size per monitor loop
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Node cache entry lifetime in hours; must cover the replication
    /// window between a node and the ways that reference it
    #[serde(default = "default_node_cache_ttl_hours")]
    pub node_cache_ttl_hours: u64,

    /// Starting URL path (e.g. "000/075/000"); takes precedence over the
    /// starting timestamp
    #[serde(default)]
    pub starting_url_path: Option<String>,

    /// Starting timestamp, used when no URL path is given
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    /// Priority boundary polygon file; read by an external collaborator
    #[serde(default)]
    pub priority_boundary_file: Option<PathBuf>,

    /// Tag statistics configuration file (YAML)
    #[serde(default)]
    pub stats_config_file: Option<PathBuf>,

    /// Compute per-changeset statistics
    #[serde(default = "default_true")]
    pub stats_enabled: bool,

    /// Run the validation plugins
    #[serde(default = "default_true")]
    pub validation_enabled: bool,

    /// Write raw features to the database
    #[serde(default = "default_true")]
    pub raw_enabled: bool,

    /// Run the changeset monitor loop
    #[serde(default = "default_true")]
    pub changesets_enabled: bool,

    /// Run the osmChange monitor loop
    #[serde(default = "default_true")]
    pub osmchanges_enabled: bool,

    /// Validator plugin selected by name
    #[serde(default = "default_validator")]
    pub validator: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Retry and polling settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// HTTP timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for UnderpassConfig {
    fn default() -> Self {
        Self {
            underpass_db_url: default_db_url(),
            db_schema: default_db_schema(),
            planet_server: None,
            planet_servers: default_planet_servers(),
            datadir: default_datadir(),
            frequency: Frequency::default(),
            concurrency: default_concurrency(),
            node_cache_ttl_hours: default_node_cache_ttl_hours(),
            starting_url_path: None,
            start_time: None,
            priority_boundary_file: None,
            stats_config_file: None,
            stats_enabled: true,
            validation_enabled: true,
            raw_enabled: true,
            changesets_enabled: true,
            osmchanges_enabled: true,
            validator: default_validator(),
            log_level: default_log_level(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl UnderpassConfig {
    /// Servers that carry the given frequency, explicit server first
    pub fn servers_for(&self, frequency: Frequency) -> Vec<PlanetServer> {
        let mut servers = Vec::new();
        if let Some(ref domain) = self.planet_server {
            let mut server = PlanetServer::new(domain.clone());
            server.datadir = self.datadir.clone();
            servers.push(server);
        }
        servers.extend(
            self.planet_servers
                .iter()
                .filter(|s| s.has_frequency(frequency))
                .cloned(),
        );
        servers
    }

    /// Servers that carry the changeset stream, explicit server first
    pub fn changeset_servers(&self) -> Vec<PlanetServer> {
        let mut servers = Vec::new();
        if let Some(ref domain) = self.planet_server {
            let mut server = PlanetServer::new(domain.clone());
            server.datadir = self.datadir.clone();
            servers.push(server);
        }
        servers.extend(
            self.planet_servers
                .iter()
                .filter(|s| s.has_changeset)
                .cloned(),
        );
        servers
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns an error message if any configuration values are invalid.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.underpass_db_url.is_empty() {
            return Err("underpass_db_url cannot be empty".to_string());
        }

        if let Some(ref server) = self.planet_server {
            if server.starts_with("http://") {
                return Err(format!(
                    "planet server must be reachable over https: {server}"
                ));
            }
        }

        if self.planet_server.is_none() && self.planet_servers.is_empty() {
            return Err("at least one planet server must be configured".to_string());
        }

        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }

        if self.node_cache_ttl_hours == 0 {
            return Err("node_cache_ttl_hours must be at least 1".to_string());
        }

        if self.retry.backoff_factor < 1.0 {
            return Err("retry.backoff_factor must be >= 1.0".to_string());
        }

        if self.retry.min_poll_interval_secs == 0
            || self.retry.max_poll_interval_secs < self.retry.min_poll_interval_secs
        {
            return Err("retry poll intervals are inconsistent".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if !self.changesets_enabled && !self.osmchanges_enabled {
            return Err("both monitor loops are disabled, nothing to do".to_string());
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_datadir() -> String {
    "replication".to_string()
}

fn default_db_url() -> String {
    "postgresql://localhost/underpass".to_string()
}

fn default_db_schema() -> String {
    "public".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "underpass.log".to_string()
}

fn default_validator() -> String {
    "hotosm".to_string()
}

fn default_node_cache_ttl_hours() -> u64 {
    24
}

fn default_min_poll_interval() -> u64 {
    30
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_poll_interval() -> u64 {
    600
}

fn default_gap_threshold() -> u64 {
    7200
}

fn default_max_http_retries() -> usize {
    3
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_total_timeout() -> u64 {
    300
}

fn default_concurrency() -> usize {
    let hardware = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    hardware.min(4)
}

fn default_planet_servers() -> Vec<PlanetServer> {
    vec![
        PlanetServer::new("planet.maps.mail.ru"),
        PlanetServer::new("planet.openstreetmap.org"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = UnderpassConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replication_url() {
        let server = PlanetServer::new("planet.openstreetmap.org");
        assert_eq!(
            server.replication_url(),
            "https://planet.openstreetmap.org/replication"
        );
    }

    #[test]
    fn test_explicit_server_takes_precedence() {
        let config = UnderpassConfig {
            planet_server: Some("mirror.example.org".to_string()),
            ..Default::default()
        };
        let servers = config.servers_for(Frequency::Minutely);
        assert_eq!(servers[0].domain, "mirror.example.org");
        assert!(servers.len() > 1);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = UnderpassConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_planet_server_rejected() {
        let config = UnderpassConfig {
            planet_server: Some("http://insecure.example.org".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frequency_capability_filter() {
        let mut server = PlanetServer::new("minutely.example.org");
        server.has_daily = false;
        let config = UnderpassConfig {
            planet_servers: vec![server],
            ..Default::default()
        };
        assert!(config.servers_for(Frequency::Daily).is_empty());
        assert_eq!(config.servers_for(Frequency::Minutely).len(), 1);
    }
}
