//! Configuration management
//!
//! Typed configuration record, validation, and the environment/dotfile
//! loading pass.

pub mod loader;
pub mod schema;

pub use loader::load_config;
pub use schema::{LoggingConfig, PlanetServer, RetryConfig, TimeoutConfig, UnderpassConfig};
