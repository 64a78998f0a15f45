//! Underpass metadata store
//!
//! Sequence cursors and failure records per replication stream. This is the
//! only component allowed to move a cursor; it does so after the file's
//! objects have been emitted.

use crate::db::client::PgClient;
use crate::domain::{Result, UnderpassError};
use crate::replication::state::{Frequency, Sequence, Stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One persisted replication cursor
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationState {
    /// Which stream the cursor belongs to
    pub stream: Stream,
    /// Update frequency of the stream
    pub frequency: Frequency,
    /// Last fully emitted sequence
    pub sequence: Sequence,
    /// Triple directory path of that sequence
    pub path: String,
    /// Data timestamp of that sequence
    pub timestamp: DateTime<Utc>,
}

impl ReplicationState {
    /// Build a state row from a sequence and timestamp
    pub fn new(
        stream: Stream,
        frequency: Frequency,
        sequence: Sequence,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            stream,
            frequency,
            sequence,
            path: sequence.path(),
            timestamp,
        }
    }
}

/// Persistence operations for replication cursors
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the cursor for a stream, if one was ever persisted
    async fn get_last(&self, stream: Stream, frequency: Frequency)
        -> Result<Option<ReplicationState>>;

    /// Persist a cursor; later sequences always win
    async fn put(&self, state: &ReplicationState) -> Result<()>;

    /// Record a permanently failed file
    async fn record_failure(
        &self,
        stream: Stream,
        sequence: Sequence,
        path: &str,
        reason: &str,
    ) -> Result<()>;
}

/// PostgreSQL-backed state store
pub struct PgStateStore {
    client: Arc<PgClient>,
}

impl PgStateStore {
    /// Create a store over the shared client
    pub fn new(client: Arc<PgClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get_last(
        &self,
        stream: Stream,
        frequency: Frequency,
    ) -> Result<Option<ReplicationState>> {
        let conn = self.client.get_connection().await?;
        let sql = format!(
            "SELECT sequence, path, timestamp FROM {}.replication_state \
             WHERE stream = $1 AND frequency = $2",
            self.client.schema()
        );
        let row = conn
            .query_opt(&sql, &[&stream.as_str(), &frequency.as_str()])
            .await
            .map_err(|e| UnderpassError::State(format!("loading cursor: {e}")))?;

        Ok(row.map(|row| ReplicationState {
            stream,
            frequency,
            sequence: Sequence(row.get::<_, i64>(0)),
            path: row.get(1),
            timestamp: row.get(2),
        }))
    }

    async fn put(&self, state: &ReplicationState) -> Result<()> {
        let conn = self.client.get_connection().await?;
        let sql = format!(
            "INSERT INTO {s}.replication_state (stream, frequency, sequence, path, timestamp, updated_at) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (stream, frequency) DO UPDATE \
               SET sequence = EXCLUDED.sequence, path = EXCLUDED.path, \
                   timestamp = EXCLUDED.timestamp, updated_at = now() \
               WHERE {s}.replication_state.sequence <= EXCLUDED.sequence",
            s = self.client.schema()
        );
        conn.execute(
            &sql,
            &[
                &state.stream.as_str(),
                &state.frequency.as_str(),
                &state.sequence.0,
                &state.path,
                &state.timestamp,
            ],
        )
        .await
        .map_err(|e| UnderpassError::State(format!("persisting cursor: {e}")))?;

        tracing::debug!(
            stream = %state.stream,
            sequence = %state.sequence,
            "cursor advanced"
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        stream: Stream,
        sequence: Sequence,
        path: &str,
        reason: &str,
    ) -> Result<()> {
        let conn = self.client.get_connection().await?;
        let sql = format!(
            "INSERT INTO {}.replication_failures (stream, sequence, path, reason) \
             VALUES ($1, $2, $3, $4)",
            self.client.schema()
        );
        conn.execute(&sql, &[&stream.as_str(), &sequence.0, &path, &reason])
            .await
            .map_err(|e| UnderpassError::State(format!("recording failure: {e}")))?;

        tracing::warn!(
            stream = %stream,
            sequence = %sequence,
            reason = reason,
            "replication file permanently failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_row_path_matches_sequence() {
        let state = ReplicationState::new(
            Stream::OsmChange,
            Frequency::Minutely,
            Sequence(5_123_456),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        assert_eq!(state.path, "005/123/456");
    }
}
