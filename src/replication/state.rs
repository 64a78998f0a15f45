//! Replication sequences and state sidecars
//!
//! A replication stream is an integer cursor encoded as a triple directory
//! path `AAA/BBB/CCC` (base-1000 digit groups). Every sequence has a state
//! sidecar: `NNN.state.txt` (key=value) on the osmChange stream and
//! `NNN.state.yaml` on the changeset stream; the top of each stream carries
//! a `state.txt` / `state.yaml` describing the latest sequence.

use crate::domain::{PlanetError, Result, UnderpassError};
use crate::parser::parse_osm_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two replication streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    /// Feature diffs (`.osc.gz`)
    OsmChange,
    /// Changeset metadata (`.osm.gz`)
    Changeset,
}

impl Stream {
    /// Name as stored in the `replication_state` table
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::OsmChange => "osmchange",
            Stream::Changeset => "changeset",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Update frequency of the osmChange stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// One file per minute
    #[default]
    Minutely,
    /// One file per hour
    Hourly,
    /// One file per day
    Daily,
}

impl Frequency {
    /// Configuration name (`minutely`, `hourly`, `daily`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Minutely => "minutely",
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
        }
    }

    /// Path segment used on the planet server (`minute`, `hour`, `day`)
    pub fn path_segment(&self) -> &'static str {
        match self {
            Frequency::Minutely => "minute",
            Frequency::Hourly => "hour",
            Frequency::Daily => "day",
        }
    }

    /// Nominal seconds between files, used to seed the timestamp search
    pub fn nominal_interval_secs(&self) -> i64 {
        match self {
            Frequency::Minutely => 60,
            Frequency::Hourly => 3600,
            Frequency::Daily => 86400,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = UnderpassError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minutely" | "minute" | "m" => Ok(Frequency::Minutely),
            "hourly" | "hour" | "h" => Ok(Frequency::Hourly),
            "daily" | "day" | "d" => Ok(Frequency::Daily),
            other => Err(UnderpassError::Configuration(format!(
                "unknown frequency '{other}', expected minutely, hourly or daily"
            ))),
        }
    }
}

/// An integer cursor into a replication stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sequence(pub i64);

impl Sequence {
    /// Render the triple directory path, e.g. 5123456 -> "005/123/456"
    pub fn path(&self) -> String {
        let seq = self.0;
        format!(
            "{:03}/{:03}/{:03}",
            seq / 1_000_000,
            (seq / 1_000) % 1_000,
            seq % 1_000
        )
    }

    /// Parse a triple directory path back into a sequence
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless the path has exactly three
    /// `/`-separated numeric groups.
    pub fn from_path(path: &str) -> Result<Self> {
        let groups: Vec<&str> = path.trim_matches('/').split('/').collect();
        if groups.len() != 3 {
            return Err(UnderpassError::Configuration(format!(
                "replication path must have three groups (AAA/BBB/CCC): '{path}'"
            )));
        }
        let mut sequence: i64 = 0;
        for group in groups {
            let value: i64 = group.parse().map_err(|_| {
                UnderpassError::Configuration(format!("bad replication path group '{group}'"))
            })?;
            if value > 999 {
                return Err(UnderpassError::Configuration(format!(
                    "replication path group out of range: '{group}'"
                )));
            }
            sequence = sequence * 1_000 + value;
        }
        Ok(Sequence(sequence))
    }

    /// The next sequence in the stream
    pub fn next(&self) -> Sequence {
        Sequence(self.0 + 1)
    }

    /// The previous sequence, saturating at zero
    pub fn prev(&self) -> Sequence {
        Sequence((self.0 - 1).max(0))
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed replication state sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct StateFile {
    /// The sequence this state describes
    pub sequence: Sequence,
    /// Timestamp of the data up to this sequence
    pub timestamp: DateTime<Utc>,
}

impl StateFile {
    /// Parse a `state.txt` sidecar
    ///
    /// The format is `key=value` lines with `#` comments; colons in the
    /// timestamp are backslash-escaped by the java properties writer.
    ///
    /// # Errors
    ///
    /// `MalformedState` when `sequenceNumber` or `timestamp` is missing or
    /// unparseable.
    pub fn parse_text(content: &str, path: &str) -> std::result::Result<Self, PlanetError> {
        let mut sequence = None;
        let mut timestamp = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.replace('\\', "");
            match key.trim() {
                "sequenceNumber" => {
                    sequence = Some(value.trim().parse::<i64>().map_err(|e| {
                        PlanetError::MalformedState {
                            path: path.to_string(),
                            reason: format!("bad sequenceNumber '{value}': {e}"),
                        }
                    })?);
                }
                "timestamp" => {
                    timestamp = Some(parse_osm_timestamp(&value).map_err(|e| {
                        PlanetError::MalformedState {
                            path: path.to_string(),
                            reason: e.to_string(),
                        }
                    })?);
                }
                _ => {}
            }
        }

        match (sequence, timestamp) {
            (Some(sequence), Some(timestamp)) => Ok(StateFile {
                sequence: Sequence(sequence),
                timestamp,
            }),
            _ => Err(PlanetError::MalformedState {
                path: path.to_string(),
                reason: "missing sequenceNumber or timestamp".to_string(),
            }),
        }
    }

    /// Parse a `state.yaml` sidecar (changeset stream)
    ///
    /// # Errors
    ///
    /// `MalformedState` when the YAML is invalid or `last_run` cannot be
    /// parsed as a timestamp.
    pub fn parse_yaml(content: &str, path: &str) -> std::result::Result<Self, PlanetError> {
        #[derive(Deserialize)]
        struct RawState {
            sequence: i64,
            last_run: String,
        }

        let raw: RawState =
            serde_yaml::from_str(content).map_err(|e| PlanetError::MalformedState {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let timestamp = parse_timestamp_with_offset(&raw.last_run).map_err(|e| {
            PlanetError::MalformedState {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(StateFile {
            sequence: Sequence(raw.sequence),
            timestamp,
        })
    }
}

/// Parse the changeset `last_run` timestamp, which carries an explicit
/// offset (e.g. `2020-07-23 20:32:01.804000000 +00:00`)
fn parse_timestamp_with_offset(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f %:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    parse_osm_timestamp(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_path_round_trip() {
        let seq = Sequence(5_123_456);
        assert_eq!(seq.path(), "005/123/456");
        assert_eq!(Sequence::from_path("005/123/456").unwrap(), seq);
    }

    #[test]
    fn test_sequence_path_small() {
        assert_eq!(Sequence(75_000).path(), "000/075/000");
        assert_eq!(Sequence(0).path(), "000/000/000");
        assert_eq!(Sequence::from_path("000/075/000").unwrap(), Sequence(75_000));
    }

    #[test]
    fn test_sequence_from_path_trims_slashes() {
        assert_eq!(Sequence::from_path("/001/001/999").unwrap(), Sequence(1_001_999));
    }

    #[test]
    fn test_sequence_from_path_rejects_garbage() {
        assert!(Sequence::from_path("001/001").is_err());
        assert!(Sequence::from_path("aaa/bbb/ccc").is_err());
        assert!(Sequence::from_path("001/1000/000").is_err());
    }

    #[test]
    fn test_sequence_next_prev() {
        assert_eq!(Sequence(41).next(), Sequence(42));
        assert_eq!(Sequence(0).prev(), Sequence(0));
    }

    #[test]
    fn test_parse_state_text() {
        let content = "#Fri Aug 01 00:00:00 UTC 2023\n\
                       sequenceNumber=5123456\n\
                       timestamp=2023-08-01T00\\:00\\:00Z\n";
        let state = StateFile::parse_text(content, "005/123/456.state.txt").unwrap();
        assert_eq!(state.sequence, Sequence(5_123_456));
        assert_eq!(state.timestamp.to_rfc3339(), "2023-08-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_state_text_missing_key() {
        let content = "sequenceNumber=5123456\n";
        let err = StateFile::parse_text(content, "p").unwrap_err();
        assert!(matches!(err, PlanetError::MalformedState { .. }));
    }

    #[test]
    fn test_parse_state_yaml() {
        let content = "---\nlast_run: 2020-07-23 20:32:01.804000000 +00:00\nsequence: 4056599\n";
        let state = StateFile::parse_yaml(content, "state.yaml").unwrap();
        assert_eq!(state.sequence, Sequence(4_056_599));
        assert_eq!(
            state.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2020-07-23 20:32:01"
        );
    }

    #[test]
    fn test_frequency_parsing() {
        assert_eq!(Frequency::from_str("minutely").unwrap(), Frequency::Minutely);
        assert_eq!(Frequency::from_str("h").unwrap(), Frequency::Hourly);
        assert_eq!(Frequency::from_str("day").unwrap(), Frequency::Daily);
        assert!(Frequency::from_str("fortnightly").is_err());
    }

    #[test]
    fn test_frequency_path_segment() {
        assert_eq!(Frequency::Minutely.path_segment(), "minute");
        assert_eq!(Frequency::Daily.path_segment(), "day");
    }
}
