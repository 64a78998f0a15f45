//! Command implementations

pub mod monitor;
pub mod status;
pub mod validate;
