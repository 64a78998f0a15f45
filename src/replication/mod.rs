//! Replication stream handling
//!
//! Sequence math and state sidecars, the remote planet client, and the two
//! monitor loops that drive the pipeline.

pub mod monitor;
pub mod planet;
pub mod state;

pub use monitor::{
    run_changeset_monitor, run_osmchange_monitor, Backoff, FileOutcome, FileState, MonitorContext,
};
pub use planet::Planet;
pub use state::{Frequency, Sequence, StateFile, Stream};
