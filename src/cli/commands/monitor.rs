//! The monitor command
//!
//! Wires configuration, database, filter, stats and validation together and
//! runs the two monitor loops until a shutdown signal arrives.

use crate::areafilter::AreaFilter;
use crate::config::{self, UnderpassConfig};
use crate::db::{Emitter, PgClient, PgStateStore};
use crate::domain::{Result, UnderpassError};
use crate::osm::NodeCache;
use crate::parser::parse_osm_timestamp;
use crate::replication::monitor::{
    run_changeset_monitor, run_osmchange_monitor, MonitorContext,
};
use crate::replication::state::{Frequency, Sequence, Stream};
use crate::replication::Planet;
use crate::stats::StatsConfig;
use crate::validation::ValidationHost;
use chrono::{DateTime, Utc};
use clap::Args;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Arguments for the monitor command
#[derive(Args, Debug, Default)]
pub struct MonitorArgs {
    /// Starting URL path (e.g. 000/075/000); takes precedence over the
    /// timestamp
    #[arg(short, long)]
    pub url: Option<String>,

    /// Starting timestamp (ISO-8601, or "now")
    #[arg(short, long)]
    pub timestamp: Option<String>,

    /// Update frequency (minutely, hourly, daily)
    #[arg(short, long)]
    pub frequency: Option<String>,

    /// Replication server domain
    #[arg(short, long)]
    pub planet: Option<String>,

    /// Database server for replicator output
    #[arg(short, long)]
    pub server: Option<String>,

    /// Worker pool size per monitor loop
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Boundary polygon file name
    #[arg(short, long)]
    pub boundary: Option<String>,

    /// Process changesets only
    #[arg(long)]
    pub changesets: bool,

    /// Process osmChanges only
    #[arg(long)]
    pub osmchanges: bool,

    /// Disable statistics collection
    #[arg(long)]
    pub disable_stats: bool,

    /// Disable validation
    #[arg(long)]
    pub disable_validation: bool,

    /// Disable raw feature output
    #[arg(long)]
    pub disable_raw: bool,
}

impl MonitorArgs {
    /// Fold the command-line options into the loaded configuration
    pub fn apply(&self, config: &mut UnderpassConfig) -> Result<()> {
        if let Some(ref url) = self.url {
            // Validate the path shape up front.
            Sequence::from_path(url)?;
            config.starting_url_path = Some(url.trim_matches('/').to_string());
        }
        if let Some(ref timestamp) = self.timestamp {
            config.start_time = Some(if timestamp == "now" {
                Utc::now()
            } else {
                parse_osm_timestamp(timestamp)
                    .map_err(|e| UnderpassError::Configuration(e.to_string()))?
            });
        }
        if let Some(ref frequency) = self.frequency {
            config.frequency = Frequency::from_str(frequency)?;
        }
        if let Some(ref planet) = self.planet {
            config.planet_server = Some(
                planet
                    .trim_start_matches("https://")
                    .trim_end_matches('/')
                    .to_string(),
            );
        }
        if let Some(ref server) = self.server {
            config.underpass_db_url = server.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(ref boundary) = self.boundary {
            config.priority_boundary_file = Some(boundary.into());
        }
        if self.changesets {
            config.osmchanges_enabled = false;
        }
        if self.osmchanges {
            config.changesets_enabled = false;
        }
        if self.disable_stats {
            config.stats_enabled = false;
        }
        if self.disable_validation {
            config.validation_enabled = false;
        }
        if self.disable_raw {
            config.raw_enabled = false;
        }
        Ok(())
    }

    /// Execute the monitor command
    ///
    /// # Errors
    ///
    /// Configuration problems surface as `Configuration` errors; anything
    /// else is an unrecoverable database or planet failure.
    pub async fn execute(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut config = config::load_config()?;
        self.apply(&mut config)?;
        config
            .validate()
            .map_err(UnderpassError::Configuration)?;

        run_replication(config, shutdown).await
    }
}

/// Build the shared context and run both monitor loops to completion
pub async fn run_replication(
    config: UnderpassConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let client = Arc::new(PgClient::new(
        &config.underpass_db_url,
        &config.db_schema,
        config.concurrency * 2,
    )?);
    client.test_connection().await?;
    client.ensure_schema().await?;

    let emitter = Arc::new(Emitter::new(Arc::clone(&client)));
    let store = Arc::new(PgStateStore::new(Arc::clone(&client)));
    let cache = Arc::new(NodeCache::with_ttl(std::time::Duration::from_secs(
        config.node_cache_ttl_hours * 3600,
    )));

    // The on-disk boundary reader is an external collaborator; without one
    // the filter passes everything through.
    let filter = Arc::new(AreaFilter::pass_all());
    if let Some(ref path) = config.priority_boundary_file {
        tracing::warn!(
            boundary = %path.display(),
            "no boundary reader registered, running without an area filter"
        );
    }

    let stats_config = Arc::new(match config.stats_config_file {
        Some(ref path) => StatsConfig::from_file(path)?,
        None => StatsConfig::default(),
    });

    let validation = if config.validation_enabled {
        Some(Arc::new(ValidationHost::new(&config.validator)?))
    } else {
        None
    };

    let alignment_timestamp = resolve_alignment_timestamp(&config).await;

    let ctx = Arc::new(MonitorContext {
        config,
        client,
        emitter,
        store,
        cache,
        filter,
        stats_config,
        validation,
        shutdown,
    });

    let osmchange_handle = if ctx.config.osmchanges_enabled {
        let ctx = Arc::clone(&ctx);
        Some(tokio::spawn(async move { run_osmchange_monitor(ctx).await }))
    } else {
        None
    };
    let changeset_handle = if ctx.config.changesets_enabled {
        let ctx = Arc::clone(&ctx);
        Some(tokio::spawn(async move {
            run_changeset_monitor(ctx, alignment_timestamp).await
        }))
    } else {
        None
    };

    for handle in [osmchange_handle, changeset_handle].into_iter().flatten() {
        handle
            .await
            .map_err(|e| UnderpassError::State(format!("monitor task failed: {e}")))??;
    }

    Ok(())
}

/// Work out the timestamp the changeset stream aligns to
///
/// An explicit starting path wins: its state sidecar carries the timestamp
/// of the osmChange file. Otherwise the configured starting timestamp is
/// used directly.
async fn resolve_alignment_timestamp(config: &UnderpassConfig) -> Option<DateTime<Utc>> {
    if let Some(ref path) = config.starting_url_path {
        let sequence = Sequence::from_path(path).ok()?;
        let planet = Planet::new(
            config.servers_for(config.frequency),
            Stream::OsmChange,
            config.frequency,
            &config.timeouts,
        )
        .ok()?;
        match planet.fetch_state(sequence).await {
            Ok(state) => return Some(state.timestamp),
            Err(e) => {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "could not read state for starting path, aligning by configured timestamp"
                );
            }
        }
    }
    config.start_time
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overrides() {
        let args = MonitorArgs {
            url: Some("000/075/000".to_string()),
            frequency: Some("daily".to_string()),
            concurrency: Some(3),
            disable_stats: true,
            ..Default::default()
        };
        let mut config = UnderpassConfig::default();
        args.apply(&mut config).unwrap();
        assert_eq!(config.starting_url_path.as_deref(), Some("000/075/000"));
        assert_eq!(config.frequency, Frequency::Daily);
        assert_eq!(config.concurrency, 3);
        assert!(!config.stats_enabled);
    }

    #[test]
    fn test_apply_rejects_bad_path() {
        let args = MonitorArgs {
            url: Some("not-a-path".to_string()),
            ..Default::default()
        };
        let mut config = UnderpassConfig::default();
        assert!(args.apply(&mut config).is_err());
    }

    #[test]
    fn test_exclusive_stream_flags() {
        let args = MonitorArgs {
            changesets: true,
            ..Default::default()
        };
        let mut config = UnderpassConfig::default();
        args.apply(&mut config).unwrap();
        assert!(!config.osmchanges_enabled);
        assert!(config.changesets_enabled);
    }
}
