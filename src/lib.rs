//! # Underpass
//!
//! Underpass ingests the OpenStreetMap replication feed in near real time,
//! filters each delta to a region of interest, derives per-changeset
//! contribution statistics and rule-based quality flags, and persists both
//! the raw features and the derived data into PostgreSQL/PostGIS.
//!
//! ## Architecture
//!
//! - [`replication`] - planet client, sequence state and the monitor loops
//! - [`parser`] - streaming XML parsers for osmChange and changeset files
//! - [`osm`] - object model and the cross-file node cache
//! - [`areafilter`] - priority polygon filtering
//! - [`stats`] - tag-config driven contribution statistics
//! - [`validation`] - compiled-in data quality rule plugins
//! - [`db`] - SQL emitter and replication metadata store
//! - [`config`] - typed configuration with environment overrides
//! - [`cli`], [`logging`] - binary surface and observability
//!
//! ## Data flow
//!
//! The monitors drive the planet client to fetch the next file, the parser
//! streams it into change frames, the filter prunes out-of-area objects,
//! stats and validation derive per-changeset data, and the emitter writes
//! everything to PostgreSQL before the cursor advances.

pub mod areafilter;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod logging;
pub mod osm;
pub mod parser;
pub mod replication;
pub mod stats;
pub mod validation;
