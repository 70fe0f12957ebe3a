//! Shared value types: byte payloads, byte ranges, extent identifiers and
//! geodetic points.

mod blob;
mod byte_range;
mod extent_id;
mod geo;

pub use blob::*;
pub use byte_range::*;
pub use extent_id::*;
pub use geo::*;
