//! Geo-indexed raster sampling.
//!
//! A vector index file describes raster tiles by footprint polygon; for every
//! query point the covering tiles are found, filtered, opened into a bounded
//! process-wide cache and sampled by a pool of reader threads. The
//! [`RasterSource`] trait is the surface the sample dispatcher consumes, with
//! [`IndexedRaster`] and [`SingleRaster`] as the two concrete sources.

mod file_directory;
mod gdal_tile;
mod raster_source;
mod sample;
mod sampler;
mod subset_pool;
mod tile_cache;
mod tile_index;

pub use file_directory::*;
pub use gdal_tile::*;
pub use raster_source::*;
pub use sample::*;
pub use sampler::*;
pub use subset_pool::*;
pub use tile_cache::*;
pub use tile_index::*;
