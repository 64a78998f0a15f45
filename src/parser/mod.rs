//! Streaming XML parsers for replication files
//!
//! Both the osmChange and the changeset formats are streamed with quick-xml
//! event readers. The original SAX callback chain is re-expressed as a match
//! over parse events, which removes the implicit back-pointer from child
//! element to parent frame.

pub mod changeset;
pub mod osmchange;

pub use changeset::{parse_changesets, ChangeSetFile};
pub use osmchange::{parse_osmchange, to_xml, FileBatch, OsmChange};

use crate::domain::{Result, UnderpassError};
use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse an OSM timestamp
///
/// Accepts the ISO-8601 form used in replication XML and state files, with
/// or without the `T` separator and the trailing `Z`. Parsing never depends
/// on the process locale; decimals use `.`.
pub fn parse_osm_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim().trim_end_matches('Z');
    let normalized = trimmed.replacen('T', " ", 1);

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Ok(naive.and_utc());
        }
    }

    // Fall back to a full RFC 3339 timestamp with an offset.
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| UnderpassError::MalformedInput(format!("bad timestamp '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_osm_timestamp_zulu() {
        let ts = parse_osm_timestamp("2023-08-01T00:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2023-08-01T00:00:00+00:00");
    }

    #[test]
    fn test_parse_osm_timestamp_space_separator() {
        let ts = parse_osm_timestamp("2023-08-01 12:34:56").unwrap();
        assert_eq!(ts.hour(), 12);
    }

    #[test]
    fn test_parse_osm_timestamp_fractional_with_offset() {
        let ts = parse_osm_timestamp("2020-07-23 20:32:01.804000000").unwrap();
        assert_eq!(ts.second(), 1);
    }

    #[test]
    fn test_parse_osm_timestamp_invalid() {
        assert!(parse_osm_timestamp("last tuesday").is_err());
    }
}
