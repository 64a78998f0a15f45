//! Domain error types
//!
//! This module defines the error hierarchy for Underpass. All errors are
//! domain-specific and don't expose third-party types; adapters convert
//! network, parser and database failures into these variants.

use thiserror::Error;

/// Main Underpass error type
///
/// This is the primary error type used throughout the application.
/// It wraps specific error types and provides context for error handling.
#[derive(Debug, Error)]
pub enum UnderpassError {
    /// Configuration-related errors, fatal at startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Planet server errors (download, state files)
    #[error("Planet error: {0}")]
    Planet(#[from] PlanetError),

    /// A replication file that could not be parsed; the file is marked
    /// permanently failed but the stream continues
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// A per-object emit failure; the object transaction was rolled back
    #[error("Emit error in {which}: {cause}")]
    Emit {
        /// Which statement or object kind failed
        which: String,
        /// Underlying database error message
        cause: String,
    },

    /// Replication cursor persistence errors
    #[error("State management error: {0}")]
    State(String),

    /// A validator plugin failed; validation is skipped for that object
    #[error("Validation plugin error: {0}")]
    Plugin(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

/// Planet server specific errors
///
/// Errors that occur when talking to the OSM planet replication servers.
/// These map onto the retry policy: transient failures rotate to the next
/// configured server, `NotFound` leaves the cursor in place until the file
/// appears, and permanent failures advance past the file.
#[derive(Debug, Error)]
pub enum PlanetError {
    /// Connect failure, timeout or 5xx; worth retrying on another server
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// The requested replication file does not exist yet (404)
    #[error("File not found: {0}")]
    NotFound(String),

    /// A 4xx other than 404; permanent for this file
    #[error("Permanent failure fetching {url}: HTTP {status}")]
    Permanent {
        /// URL that failed
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// A state sidecar that could not be parsed
    #[error("Malformed state file {path}: {reason}")]
    MalformedState {
        /// Remote path of the sidecar
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Every configured planet server was tried and failed
    #[error("All planet servers failed: {0}")]
    AllServersFailed(String),
}

impl PlanetError {
    /// Whether the monitor should retry this failure with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlanetError::TransientNetwork(_)
                | PlanetError::AllServersFailed(_)
                | PlanetError::MalformedState { .. }
        )
    }
}

impl From<std::io::Error> for UnderpassError {
    fn from(err: std::io::Error) -> Self {
        UnderpassError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for UnderpassError {
    fn from(err: serde_json::Error) -> Self {
        UnderpassError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for UnderpassError {
    fn from(err: serde_yaml::Error) -> Self {
        UnderpassError::Serialization(err.to_string())
    }
}

impl From<tokio_postgres::Error> for UnderpassError {
    fn from(err: tokio_postgres::Error) -> Self {
        UnderpassError::Database(err.to_string())
    }
}
