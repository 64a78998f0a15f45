//! The status command

use crate::config;
use crate::db::PgClient;
use crate::domain::Result;
use chrono::{DateTime, Utc};
use clap::Args;

/// Arguments for the status command
#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Database server for replicator output
    #[arg(short, long)]
    pub server: Option<String>,

    /// How many recent failures to show
    #[arg(long, default_value_t = 10)]
    pub failures: i64,
}

impl StatusArgs {
    /// Print the replication cursors and the most recent failures
    pub async fn execute(&self) -> Result<()> {
        let mut config = config::load_config()?;
        if let Some(ref server) = self.server {
            config.underpass_db_url = server.clone();
        }

        let client = PgClient::new(&config.underpass_db_url, &config.db_schema, 2)?;
        let conn = client.get_connection().await?;

        let state_sql = format!(
            "SELECT stream, frequency, sequence, path, timestamp, updated_at \
             FROM {}.replication_state ORDER BY stream",
            client.schema()
        );
        let rows = conn.query(&state_sql, &[]).await.map_err(|e| {
            crate::domain::UnderpassError::Database(format!("reading replication state: {e}"))
        })?;

        if rows.is_empty() {
            println!("No replication state recorded yet.");
        }
        for row in rows {
            let stream: String = row.get(0);
            let frequency: String = row.get(1);
            let sequence: i64 = row.get(2);
            let path: String = row.get(3);
            let timestamp: Option<DateTime<Utc>> = row.get(4);
            let updated_at: DateTime<Utc> = row.get(5);
            println!(
                "{stream:<10} {frequency:<9} sequence {sequence} ({path}) data {} updated {}",
                timestamp
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                updated_at.to_rfc3339()
            );
        }

        let failure_sql = format!(
            "SELECT stream, sequence, path, reason, occurred_at \
             FROM {}.replication_failures ORDER BY occurred_at DESC LIMIT $1",
            client.schema()
        );
        let rows = conn.query(&failure_sql, &[&self.failures]).await.map_err(|e| {
            crate::domain::UnderpassError::Database(format!("reading failures: {e}"))
        })?;

        if !rows.is_empty() {
            println!("\nRecent failures:");
            for row in rows {
                let stream: String = row.get(0);
                let sequence: i64 = row.get(1);
                let path: String = row.get(2);
                let reason: String = row.get(3);
                let occurred_at: DateTime<Utc> = row.get(4);
                println!(
                    "{} {stream} {sequence} ({path}): {reason}",
                    occurred_at.to_rfc3339()
                );
            }
        }

        Ok(())
    }
}
