//! Core domain types
//!
//! Error taxonomy and the shared result alias. The OSM object model lives in
//! [`crate::osm`]; this module only carries types every layer depends on.

pub mod errors;
pub mod result;

pub use errors::{PlanetError, UnderpassError};
pub use result::Result;
