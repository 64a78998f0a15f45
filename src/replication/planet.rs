//! Remote planet server client
//!
//! Downloads replication files and state sidecars over HTTPS with
//! keep-alive, per-request timeouts and failover across the configured
//! server list. Gzip payloads are decompressed transparently.

use crate::config::{PlanetServer, TimeoutConfig};
use crate::domain::PlanetError;
use crate::replication::state::{Frequency, Sequence, StateFile, Stream};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Client for one replication stream
///
/// The client remembers which server last worked and starts there, rotating
/// to the next server on connect failures, timeouts and 5xx responses. A 404
/// means the file does not exist yet and is not a failover trigger.
pub struct Planet {
    client: reqwest::Client,
    servers: Vec<PlanetServer>,
    stream: Stream,
    frequency: Frequency,
    current: AtomicUsize,
}

impl Planet {
    /// Create a client over the given servers
    ///
    /// # Errors
    ///
    /// Returns `AllServersFailed` if the server list is empty or the HTTP
    /// client cannot be constructed.
    pub fn new(
        servers: Vec<PlanetServer>,
        stream: Stream,
        frequency: Frequency,
        timeouts: &TimeoutConfig,
    ) -> Result<Self, PlanetError> {
        if servers.is_empty() {
            return Err(PlanetError::AllServersFailed(
                "no planet servers configured for this stream".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .timeout(Duration::from_secs(timeouts.total_secs))
            .build()
            .map_err(|e| PlanetError::AllServersFailed(format!("http client: {e}")))?;

        Ok(Self {
            client,
            servers,
            stream,
            frequency,
            current: AtomicUsize::new(0),
        })
    }

    /// Directory under the replication base for this stream
    fn stream_segment(&self) -> &'static str {
        match self.stream {
            Stream::OsmChange => self.frequency.path_segment(),
            Stream::Changeset => "changesets",
        }
    }

    /// Remote path of the data file for a sequence, relative to the base
    pub fn data_path(&self, sequence: Sequence) -> String {
        let suffix = match self.stream {
            Stream::OsmChange => "osc.gz",
            Stream::Changeset => "osm.gz",
        };
        format!("{}/{}.{}", self.stream_segment(), sequence.path(), suffix)
    }

    /// Remote path of the per-sequence state sidecar
    pub fn state_path(&self, sequence: Sequence) -> String {
        let suffix = match self.stream {
            Stream::OsmChange => "state.txt",
            Stream::Changeset => "state.yaml",
        };
        format!("{}/{}.{}", self.stream_segment(), sequence.path(), suffix)
    }

    /// Remote path of the stream-level latest state file
    pub fn latest_state_path(&self) -> String {
        let name = match self.stream {
            Stream::OsmChange => "state.txt",
            Stream::Changeset => "state.yaml",
        };
        format!("{}/{}", self.stream_segment(), name)
    }

    fn url_for(&self, server: &PlanetServer, path: &str) -> String {
        format!("{}/{}", server.replication_url(), path)
    }

    /// HTTPS GET with server failover
    ///
    /// # Errors
    ///
    /// `NotFound` and `Permanent` stop the attempt immediately; transient
    /// failures advance to the next server, and exhausting the list yields
    /// `AllServersFailed`.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, PlanetError> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = String::new();

        for offset in 0..self.servers.len() {
            let index = (start + offset) % self.servers.len();
            let server = &self.servers[index];
            let url = self.url_for(server, path);

            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.bytes().await.map_err(|e| {
                            PlanetError::TransientNetwork(format!("reading {url}: {e}"))
                        })?;
                        self.current.store(index, Ordering::Relaxed);
                        return Ok(body.to_vec());
                    }
                    if status.as_u16() == 404 {
                        return Err(PlanetError::NotFound(url));
                    }
                    if status.is_client_error() {
                        return Err(PlanetError::Permanent {
                            url,
                            status: status.as_u16(),
                        });
                    }
                    // 5xx: try the next server.
                    tracing::warn!(
                        url = %url,
                        status = status.as_u16(),
                        "planet server error, trying next server"
                    );
                    last_error = format!("{url}: HTTP {}", status.as_u16());
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "planet request failed, trying next server");
                    last_error = format!("{url}: {e}");
                }
            }
        }

        Err(PlanetError::AllServersFailed(last_error))
    }

    /// Download and decompress the data file for a sequence
    pub async fn fetch_changes(&self, sequence: Sequence) -> Result<Vec<u8>, PlanetError> {
        let path = self.data_path(sequence);
        let compressed = self.download(&path).await?;
        gunzip(&compressed).map_err(|e| PlanetError::TransientNetwork(format!("{path}: {e}")))
    }

    /// Fetch and parse the state sidecar for a sequence
    pub async fn fetch_state(&self, sequence: Sequence) -> Result<StateFile, PlanetError> {
        let path = self.state_path(sequence);
        let body = self.download(&path).await?;
        let content = String::from_utf8_lossy(&body);
        self.parse_state(&content, &path)
    }

    /// Probe the latest sequence available on the stream
    pub async fn probe_latest(&self) -> Result<StateFile, PlanetError> {
        let path = self.latest_state_path();
        let body = self.download(&path).await?;
        let content = String::from_utf8_lossy(&body);
        self.parse_state(&content, &path)
    }

    fn parse_state(&self, content: &str, path: &str) -> Result<StateFile, PlanetError> {
        match self.stream {
            Stream::OsmChange => StateFile::parse_text(content, path),
            Stream::Changeset => StateFile::parse_yaml(content, path),
        }
    }

    /// Find the latest sequence whose timestamp is `<= target`
    ///
    /// Binary-searches the state sidecars between sequence 1 and the stream
    /// head. Sequences with missing sidecars are treated as too new.
    pub async fn find_sequence_at(
        &self,
        target: chrono::DateTime<chrono::Utc>,
    ) -> Result<StateFile, PlanetError> {
        let latest = self.probe_latest().await?;
        if latest.timestamp <= target {
            return Ok(latest);
        }

        let mut lo: i64 = 1;
        let mut hi: i64 = latest.sequence.0;
        let mut best: Option<StateFile> = None;

        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            match self.fetch_state(Sequence(mid)).await {
                Ok(state) => {
                    if state.timestamp <= target {
                        lo = mid + 1;
                        best = Some(state);
                    } else {
                        hi = mid - 1;
                    }
                }
                Err(PlanetError::NotFound(_)) => {
                    hi = mid - 1;
                }
                Err(e) => return Err(e),
            }
        }

        best.ok_or_else(|| {
            PlanetError::NotFound(format!("no sequence at or before {target}"))
        })
    }

    /// Find the smallest sequence whose timestamp is `>= target`
    ///
    /// This is the changeset/osmChange alignment rule: when the osmChange
    /// monitor starts at some timestamp, the changeset monitor begins at the
    /// smallest changeset sequence that still satisfies `>=` that timestamp.
    pub async fn find_sequence_after(
        &self,
        target: chrono::DateTime<chrono::Utc>,
    ) -> Result<StateFile, PlanetError> {
        let latest = self.probe_latest().await?;
        if latest.timestamp < target {
            // The stream has not caught up yet; start at the head.
            return Ok(latest);
        }

        let mut lo: i64 = 1;
        let mut hi: i64 = latest.sequence.0;
        let mut best = latest;

        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            match self.fetch_state(Sequence(mid)).await {
                Ok(state) => {
                    if state.timestamp >= target {
                        best = state;
                        hi = mid - 1;
                    } else {
                        lo = mid + 1;
                    }
                }
                Err(PlanetError::NotFound(_)) => {
                    lo = mid + 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(best)
    }
}

/// Decompress a gzip buffer
pub fn gunzip(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn planet(stream: Stream, frequency: Frequency) -> Planet {
        Planet::new(
            vec![PlanetServer::new("planet.openstreetmap.org")],
            stream,
            frequency,
            &TimeoutConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_osmchange_paths() {
        let planet = planet(Stream::OsmChange, Frequency::Minutely);
        assert_eq!(planet.data_path(Sequence(5_123_456)), "minute/005/123/456.osc.gz");
        assert_eq!(
            planet.state_path(Sequence(5_123_456)),
            "minute/005/123/456.state.txt"
        );
        assert_eq!(planet.latest_state_path(), "minute/state.txt");
    }

    #[test]
    fn test_changeset_paths() {
        let planet = planet(Stream::Changeset, Frequency::Minutely);
        assert_eq!(planet.data_path(Sequence(4_056_599)), "changesets/004/056/599.osm.gz");
        assert_eq!(
            planet.state_path(Sequence(4_056_599)),
            "changesets/004/056/599.state.yaml"
        );
        assert_eq!(planet.latest_state_path(), "changesets/state.yaml");
    }

    #[test]
    fn test_hourly_path_segment() {
        let planet = planet(Stream::OsmChange, Frequency::Hourly);
        assert_eq!(planet.data_path(Sequence(75_000)), "hour/000/075/000.osc.gz");
    }

    #[test]
    fn test_url_building() {
        let planet = planet(Stream::OsmChange, Frequency::Minutely);
        let server = PlanetServer::new("planet.openstreetmap.org");
        assert_eq!(
            planet.url_for(&server, "minute/state.txt"),
            "https://planet.openstreetmap.org/replication/minute/state.txt"
        );
    }

    #[test]
    fn test_empty_server_list_rejected() {
        let result = Planet::new(
            Vec::new(),
            Stream::OsmChange,
            Frequency::Minutely,
            &TimeoutConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_gunzip_round_trip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<osmChange/>").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"<osmChange/>");
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }
}
