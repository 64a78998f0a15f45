//! Replication monitors
//!
//! Two long-running loops walk the planet server: one for changeset files,
//! one for osmChange files. Each loop owns a bounded worker pool; files may
//! download and process in parallel, but the cursor only advances once every
//! earlier file has been emitted, so the persisted sequence is strictly
//! monotone. Polling for a file that does not exist yet backs off
//! exponentially, and polling past the last known sequence for too long is
//! reported as a gap.

use crate::areafilter::AreaFilter;
use crate::config::UnderpassConfig;
use crate::db::{Emitter, PgClient, ReplicationState, StateStore};
use crate::domain::{PlanetError, Result, UnderpassError};
use crate::osm::NodeCache;
use crate::parser::{parse_changesets, parse_osmchange};
use crate::replication::planet::Planet;
use crate::replication::state::{Sequence, Stream};
use crate::stats::{collect_stats, StatsConfig};
use crate::validation::ValidationHost;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Per-file pipeline states, used for progress logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    /// The sequence was selected for processing
    Discovered,
    /// The file body arrived and decompressed
    Downloaded,
    /// The file parsed into frames
    Parsed,
    /// The area filter ran
    Filtered,
    /// Stats and validation ran
    Scored,
    /// All objects were written
    Emitted,
    /// The cursor moved past the file
    CursorAdvanced,
    /// A retryable failure; the file is re-enqueued with backoff
    FailedTransient,
    /// A permanent failure; recorded and skipped
    FailedPermanent,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileState::Discovered => "discovered",
            FileState::Downloaded => "downloaded",
            FileState::Parsed => "parsed",
            FileState::Filtered => "filtered",
            FileState::Scored => "scored",
            FileState::Emitted => "emitted",
            FileState::CursorAdvanced => "cursor-advanced",
            FileState::FailedTransient => "failed-transient",
            FileState::FailedPermanent => "failed-permanent",
        };
        f.write_str(name)
    }
}

/// Terminal result of processing one file
#[derive(Debug, Clone)]
pub enum FileOutcome {
    /// The file was fully emitted; carry its data timestamp forward
    Emitted {
        /// Maximum data timestamp observed in the file
        timestamp: Option<DateTime<Utc>>,
    },
    /// Not there yet, or a retryable failure
    Transient {
        /// Why the file will be retried
        reason: String,
    },
    /// The file can never be processed; record and move on
    Permanent {
        /// Why the file failed
        reason: String,
    },
}

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff with the configured base, factor and cap
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            attempts: 0,
        }
    }

    /// Delay for the next attempt; grows geometrically up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(self.attempts as i32);
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }

    /// Reset after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Keeps out-of-order completions until the next expected sequence arrives
#[derive(Debug)]
struct ReorderBuffer<T> {
    pending: BTreeMap<i64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    fn push(&mut self, sequence: i64, value: T) {
        self.pending.insert(sequence, value);
    }

    fn pop_next(&mut self, next: i64) -> Option<T> {
        self.pending.remove(&next)
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Everything a monitor loop needs, shared across workers
pub struct MonitorContext {
    /// Loaded configuration
    pub config: UnderpassConfig,
    /// Shared database client
    pub client: Arc<PgClient>,
    /// SQL emitter
    pub emitter: Arc<Emitter>,
    /// Cursor persistence
    pub store: Arc<dyn StateStore>,
    /// Cross-file node cache
    pub cache: Arc<NodeCache>,
    /// Priority boundary filter
    pub filter: Arc<AreaFilter>,
    /// Tag category configuration
    pub stats_config: Arc<StatsConfig>,
    /// Validation host, when enabled
    pub validation: Option<Arc<ValidationHost>>,
    /// Graceful shutdown signal
    pub shutdown: watch::Receiver<bool>,
}

impl MonitorContext {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Persist a cursor, retrying transient database hiccups
///
/// Only repeated persistence failures terminate the monitor.
async fn persist_cursor(ctx: &MonitorContext, state: &ReplicationState) -> Result<()> {
    let mut last_error = None;
    for attempt in 1..=3u32 {
        match ctx.store.put(state).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    stream = %state.stream,
                    sequence = %state.sequence,
                    attempt,
                    error = %e,
                    "cursor persistence failed"
                );
                last_error = Some(e);
                tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
            }
        }
    }
    Err(last_error.expect("retry loop ran"))
}

/// Resolve where the osmChange monitor starts
///
/// Priority order: persisted cursor, explicit starting path, starting
/// timestamp, stream head.
pub async fn resolve_osmchange_start(
    ctx: &MonitorContext,
    planet: &Planet,
) -> Result<Sequence> {
    if let Some(state) = ctx
        .store
        .get_last(Stream::OsmChange, ctx.config.frequency)
        .await?
    {
        tracing::info!(sequence = %state.sequence, "resuming osmChange from persisted cursor");
        return Ok(state.sequence.next());
    }

    if let Some(ref path) = ctx.config.starting_url_path {
        let sequence = Sequence::from_path(path)?;
        tracing::info!(sequence = %sequence, path = %path, "starting osmChange from explicit path");
        return Ok(sequence);
    }

    if let Some(start_time) = ctx.config.start_time {
        let state = planet.find_sequence_at(start_time).await?;
        tracing::info!(
            sequence = %state.sequence,
            timestamp = %state.timestamp,
            "starting osmChange from timestamp"
        );
        return Ok(state.sequence);
    }

    let head = planet.probe_latest().await?;
    tracing::info!(sequence = %head.sequence, "starting osmChange at stream head");
    Ok(head.sequence)
}

/// Resolve where the changeset monitor starts
///
/// A persisted cursor wins. Otherwise the changeset stream is aligned to
/// the osmChange starting point: the smallest changeset sequence whose
/// timestamp still satisfies `>=` the osmChange timestamp.
pub async fn resolve_changeset_start(
    ctx: &MonitorContext,
    planet: &Planet,
    osmchange_timestamp: Option<DateTime<Utc>>,
) -> Result<Sequence> {
    if let Some(state) = ctx
        .store
        .get_last(Stream::Changeset, ctx.config.frequency)
        .await?
    {
        tracing::info!(sequence = %state.sequence, "resuming changesets from persisted cursor");
        return Ok(state.sequence.next());
    }

    if let Some(timestamp) = osmchange_timestamp {
        let state = planet.find_sequence_after(timestamp).await?;
        tracing::info!(
            sequence = %state.sequence,
            timestamp = %state.timestamp,
            "aligned changeset stream to osmChange timestamp"
        );
        return Ok(state.sequence);
    }

    let head = planet.probe_latest().await?;
    tracing::info!(sequence = %head.sequence, "starting changesets at stream head");
    Ok(head.sequence)
}

/// Run the osmChange monitor until shutdown
pub async fn run_osmchange_monitor(ctx: Arc<MonitorContext>) -> Result<()> {
    let planet = Arc::new(Planet::new(
        ctx.config.servers_for(ctx.config.frequency),
        Stream::OsmChange,
        ctx.config.frequency,
        &ctx.config.timeouts,
    )?);
    let start = resolve_osmchange_start(&ctx, &planet).await?;
    run_monitor(ctx, planet, Stream::OsmChange, start).await
}

/// Run the changeset monitor until shutdown
pub async fn run_changeset_monitor(
    ctx: Arc<MonitorContext>,
    osmchange_timestamp: Option<DateTime<Utc>>,
) -> Result<()> {
    let planet = Arc::new(Planet::new(
        ctx.config.changeset_servers(),
        Stream::Changeset,
        ctx.config.frequency,
        &ctx.config.timeouts,
    )?);
    let start = resolve_changeset_start(&ctx, &planet, osmchange_timestamp).await?;
    run_monitor(ctx, planet, Stream::Changeset, start).await
}

/// The shared monitor loop
async fn run_monitor(
    ctx: Arc<MonitorContext>,
    planet: Arc<Planet>,
    stream: Stream,
    start: Sequence,
) -> Result<()> {
    let concurrency = ctx.config.concurrency.max(1);
    let retry = &ctx.config.retry;
    let mut backoff = Backoff::new(
        Duration::from_secs(retry.min_poll_interval_secs),
        retry.backoff_factor,
        Duration::from_secs(retry.max_poll_interval_secs),
    );
    let gap_threshold = Duration::from_secs(retry.gap_threshold_secs);

    let mut in_flight: JoinSet<(i64, FileOutcome)> = JoinSet::new();
    let mut completed: ReorderBuffer<FileOutcome> = ReorderBuffer::default();
    let mut head: Option<Sequence> = None;
    let mut next_fetch = start.0;
    let mut next_advance = start.0;
    let mut last_progress = Instant::now();
    let mut shutdown = ctx.shutdown.clone();

    tracing::info!(stream = %stream, start = %start, concurrency, "monitor started");

    loop {
        if ctx.is_shutdown() {
            break;
        }

        // Learn the stream head so workers are only spawned for files that
        // should exist.
        if head.map(|h| next_fetch > h.0).unwrap_or(true) {
            match planet.probe_latest().await {
                Ok(state) => {
                    head = Some(state.sequence);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(stream = %stream, error = %e, "probing stream head failed");
                }
                Err(PlanetError::NotFound(path)) => {
                    tracing::warn!(stream = %stream, path = %path, "stream head state missing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        while in_flight.len() < concurrency
            && completed.len() < concurrency
            && head.map(|h| next_fetch <= h.0).unwrap_or(false)
        {
            let sequence = Sequence(next_fetch);
            tracing::debug!(stream = %stream, sequence = %sequence, state = %FileState::Discovered, "file state");
            let task_ctx = Arc::clone(&ctx);
            let task_planet = Arc::clone(&planet);
            in_flight.spawn(async move {
                let outcome = process_file(&task_ctx, &task_planet, stream, sequence).await;
                (sequence.0, outcome)
            });
            next_fetch += 1;
        }

        if in_flight.is_empty() {
            // Caught up with the stream; poll with bounded backoff.
            let delay = backoff.next_delay();
            if last_progress.elapsed() > gap_threshold {
                tracing::warn!(
                    stream = %stream,
                    stalled_for_secs = last_progress.elapsed().as_secs(),
                    "gap: no new replication files past the last known sequence"
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let joined = tokio::select! {
            joined = in_flight.join_next() => joined,
            _ = shutdown.changed() => None,
        };

        let Some(joined) = joined else {
            continue;
        };
        let (sequence, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(stream = %stream, error = %e, "worker panicked");
                continue;
            }
        };
        completed.push(sequence, outcome);

        // Advance the cursor strictly in order.
        while let Some(outcome) = completed.pop_next(next_advance) {
            let sequence = Sequence(next_advance);
            match outcome {
                FileOutcome::Emitted { timestamp } => {
                    let state = ReplicationState::new(
                        stream,
                        ctx.config.frequency,
                        sequence,
                        timestamp.unwrap_or_else(Utc::now),
                    );
                    persist_cursor(&ctx, &state).await?;
                    tracing::info!(
                        stream = %stream,
                        sequence = %sequence,
                        state = %FileState::CursorAdvanced,
                        "file state"
                    );
                    next_advance += 1;
                    last_progress = Instant::now();
                    backoff.reset();
                    if sequence.0 % 60 == 0 {
                        let evicted = ctx.cache.prune();
                        if evicted > 0 {
                            tracing::debug!(evicted, "node cache pruned");
                        }
                    }
                }
                FileOutcome::Permanent { reason } => {
                    tracing::error!(
                        stream = %stream,
                        sequence = %sequence,
                        state = %FileState::FailedPermanent,
                        reason = %reason,
                        "file state"
                    );
                    ctx.store
                        .record_failure(stream, sequence, &sequence.path(), &reason)
                        .await?;
                    // The cursor advances so the pipeline is not stuck.
                    let state = ReplicationState::new(
                        stream,
                        ctx.config.frequency,
                        sequence,
                        Utc::now(),
                    );
                    persist_cursor(&ctx, &state).await?;
                    next_advance += 1;
                    last_progress = Instant::now();
                }
                FileOutcome::Transient { reason } => {
                    let delay = backoff.next_delay();
                    tracing::info!(
                        stream = %stream,
                        sequence = %sequence,
                        state = %FileState::FailedTransient,
                        reason = %reason,
                        retry_in_secs = delay.as_secs(),
                        "file state"
                    );
                    if ctx.is_shutdown() {
                        break;
                    }
                    let task_ctx = Arc::clone(&ctx);
                    let task_planet = Arc::clone(&planet);
                    in_flight.spawn(async move {
                        tokio::time::sleep(delay).await;
                        let outcome =
                            process_file(&task_ctx, &task_planet, stream, sequence).await;
                        (sequence.0, outcome)
                    });
                    break;
                }
            }
        }
    }

    // Graceful shutdown: stop enqueuing, drain in-flight work, advance what
    // completed in order.
    tracing::info!(stream = %stream, "draining in-flight files before exit");
    while let Some(joined) = in_flight.join_next().await {
        if let Ok((sequence, outcome)) = joined {
            completed.push(sequence, outcome);
        }
    }
    while let Some(outcome) = completed.pop_next(next_advance) {
        let sequence = Sequence(next_advance);
        match outcome {
            FileOutcome::Emitted { timestamp } => {
                let state = ReplicationState::new(
                    stream,
                    ctx.config.frequency,
                    sequence,
                    timestamp.unwrap_or_else(Utc::now),
                );
                persist_cursor(&ctx, &state).await?;
                next_advance += 1;
            }
            FileOutcome::Permanent { reason } => {
                ctx.store
                    .record_failure(stream, sequence, &sequence.path(), &reason)
                    .await?;
                let state = ReplicationState::new(
                    stream,
                    ctx.config.frequency,
                    sequence,
                    Utc::now(),
                );
                persist_cursor(&ctx, &state).await?;
                next_advance += 1;
            }
            // Re-processed after restart; the cursor stays put.
            FileOutcome::Transient { .. } => break,
        }
    }
    tracing::info!(stream = %stream, "monitor stopped");
    Ok(())
}

/// Download, parse, filter, score and emit one file
async fn process_file(
    ctx: &MonitorContext,
    planet: &Planet,
    stream: Stream,
    sequence: Sequence,
) -> FileOutcome {
    let bytes = match planet.fetch_changes(sequence).await {
        Ok(bytes) => bytes,
        Err(PlanetError::NotFound(path)) => {
            return FileOutcome::Transient {
                reason: format!("not available yet: {path}"),
            };
        }
        Err(e) if e.is_retryable() => {
            return FileOutcome::Transient {
                reason: e.to_string(),
            };
        }
        Err(e) => {
            return FileOutcome::Permanent {
                reason: e.to_string(),
            };
        }
    };
    tracing::debug!(stream = %stream, sequence = %sequence, state = %FileState::Downloaded, bytes = bytes.len(), "file state");

    match stream {
        Stream::OsmChange => process_osmchange_bytes(ctx, sequence, &bytes).await,
        Stream::Changeset => process_changeset_bytes(ctx, sequence, &bytes).await,
    }
}

async fn process_osmchange_bytes(
    ctx: &MonitorContext,
    sequence: Sequence,
    bytes: &[u8],
) -> FileOutcome {
    let mut batch = match parse_osmchange(bytes, &ctx.cache) {
        Ok(batch) => batch,
        Err(e) => {
            return FileOutcome::Permanent {
                reason: e.to_string(),
            };
        }
    };
    tracing::debug!(sequence = %sequence, state = %FileState::Parsed, objects = batch.len(), "file state");

    ctx.filter.filter_batch(&mut batch);
    tracing::debug!(sequence = %sequence, state = %FileState::Filtered, objects = batch.len(), "file state");

    let stats = if ctx.config.stats_enabled {
        Some(collect_stats(&batch, &ctx.cache, &ctx.stats_config))
    } else {
        None
    };
    let findings = ctx.validation.as_ref().map(|host| {
        let mut findings = host.validate_nodes(&batch);
        findings.extend(host.validate_ways(&batch));
        findings
    });
    tracing::debug!(
        sequence = %sequence,
        state = %FileState::Scored,
        changesets = stats.as_ref().map(BTreeMap::len).unwrap_or(0),
        findings = findings.as_ref().map(Vec::len).unwrap_or(0),
        "file state"
    );

    if ctx.config.raw_enabled {
        match ctx.emitter.emit_batch(&batch).await {
            Ok(summary) => {
                tracing::info!(
                    sequence = %sequence,
                    state = %FileState::Emitted,
                    written = summary.written(),
                    failures = summary.failures,
                    "file state"
                );
            }
            Err(UnderpassError::Emit { which, cause }) => {
                return FileOutcome::Permanent {
                    reason: format!("emit escalation in {which}: {cause}"),
                };
            }
            Err(e) => {
                return FileOutcome::Transient {
                    reason: e.to_string(),
                };
            }
        }
    }

    if let Some(stats) = &stats {
        if let Err(e) = ctx.emitter.apply_stats(stats).await {
            return FileOutcome::Transient {
                reason: format!("stats: {e}"),
            };
        }
    }
    if let Some(findings) = &findings {
        if let Err(e) = ctx.emitter.apply_validation(findings).await {
            return FileOutcome::Transient {
                reason: format!("validation: {e}"),
            };
        }
    }

    FileOutcome::Emitted {
        timestamp: batch.final_entry,
    }
}

async fn process_changeset_bytes(
    ctx: &MonitorContext,
    sequence: Sequence,
    bytes: &[u8],
) -> FileOutcome {
    let mut file = match parse_changesets(bytes) {
        Ok(file) => file,
        Err(e) => {
            return FileOutcome::Permanent {
                reason: e.to_string(),
            };
        }
    };
    tracing::debug!(sequence = %sequence, state = %FileState::Parsed, changesets = file.changes.len(), "file state");

    ctx.filter.filter_changesets(&mut file);
    tracing::debug!(sequence = %sequence, state = %FileState::Filtered, changesets = file.changes.len(), "file state");

    let mut consecutive = 0usize;
    for cs in &file.changes {
        match ctx.emitter.apply_changeset(cs).await {
            Ok(()) => consecutive = 0,
            Err(e) => {
                consecutive += 1;
                tracing::error!(changeset = cs.id, error = %e, "changeset emit failed, skipped");
                if consecutive >= 3 {
                    return FileOutcome::Permanent {
                        reason: format!("{consecutive} consecutive changeset emit failures"),
                    };
                }
            }
        }
    }
    tracing::info!(
        sequence = %sequence,
        state = %FileState::Emitted,
        changesets = file.changes.len(),
        "file state"
    );

    FileOutcome::Emitted {
        timestamp: file.last_closed_at,
    }
}
