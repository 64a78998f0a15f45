//! PostgreSQL integration
//!
//! Connection pooling, the SQL emitter and the replication metadata store.

pub mod client;
pub mod emitter;
pub mod metadata;

pub use client::PgClient;
pub use emitter::{Emitter, EmitSummary};
pub use metadata::{PgStateStore, ReplicationState, StateStore};
