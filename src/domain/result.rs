//! Result type alias for Underpass operations

use crate::domain::errors::UnderpassError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, UnderpassError>;
