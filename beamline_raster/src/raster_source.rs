//! The raster-object surface the sample dispatcher consumes.
//!
//! Two concrete sources expose the same capability: [`IndexedRaster`] finds
//! covering tiles through a vector index and samples them via the shared tile
//! cache and reader pool; [`SingleRaster`] is the one-file shortcut.

use super::file_directory::FileDirectory;
use super::gdal_tile::GdalRaster;
use super::sample::RasterSample;
use super::sampler::{ReaderTask, reader_pool};
use super::tile_cache::{CacheEntry, TileRole, tile_cache};
use super::tile_index::{TileGroup, TileIndex, filter_groups, group_tiles};
use beamline_core::config::{RequestConfig, SamplingAlgo};
use beamline_core::failure::{FailureKind, failure_kind_of};
use beamline_core::types::GeoPoint;
use anyhow::Result;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// One per-tile sampling failure, surfaced alongside the samples rather than
/// aborting them.
#[derive(Debug)]
pub struct SampleError {
	pub kind: Option<FailureKind>,
	pub url: String,
	pub text: String,
}

/// What one sampling request produced.
#[derive(Debug, Default)]
pub struct SampleOutcome {
	pub samples: Vec<RasterSample>,
	pub errors: Vec<SampleError>,
}

/// A source of raster samples for query points.
pub trait RasterSource: Send + Sync {
	/// Short key identifying this source on the output queue.
	fn key(&self) -> &str;

	/// Samples every covering tile at `point`. `gps` is the point's own
	/// acquisition time, used by time filters.
	fn get_samples(&self, point: &GeoPoint, gps: f64, directory: &FileDirectory) -> Result<SampleOutcome>;
}

/// Tile sampling driven by a vector index.
pub struct IndexedRaster {
	key: String,
	index: TileIndex,
	config: Arc<RequestConfig>,
	sample_timeout: Duration,
}

impl IndexedRaster {
	pub fn open(key: &str, location: &str, config: Arc<RequestConfig>) -> Result<IndexedRaster> {
		let index = TileIndex::open(location)?;
		let sample_timeout = Duration::from_secs(config.read_timeout.max(1));
		Ok(IndexedRaster {
			key: key.to_string(),
			index,
			config,
			sample_timeout,
		})
	}

	/// Loads one group's tiles into the cache, returning the value/flags
	/// pairing for the merge after sampling.
	fn load_group(&self, group: &TileGroup) -> Vec<(Arc<CacheEntry>, Option<Arc<CacheEntry>>)> {
		let mut pairs = Vec::new();
		for tile in &group.entries {
			let value = tile_cache().enable_or_insert(&tile.url, &group.id, TileRole::Value);
			let flags = tile
				.flags_url
				.as_ref()
				.map(|url| tile_cache().enable_or_insert(url, &group.id, TileRole::Flags));
			pairs.push((value, flags));
		}
		pairs
	}
}

impl RasterSource for IndexedRaster {
	fn key(&self) -> &str {
		&self.key
	}

	fn get_samples(&self, point: &GeoPoint, gps: f64, directory: &FileDirectory) -> Result<SampleOutcome> {
		let mut outcome = SampleOutcome::default();

		// every sampling round starts from a disabled cache and re-enables
		// exactly the tiles this point needs
		tile_cache().disable_all();

		let tiles = self.index.find_tiles(point)?;
		if tiles.is_empty() {
			return Ok(outcome);
		}
		let groups = filter_groups(group_tiles(tiles), &self.config, Some(gps));
		if groups.is_empty() {
			return Ok(outcome);
		}

		let mut loaded: Vec<(f64, Vec<(Arc<CacheEntry>, Option<Arc<CacheEntry>>)>)> = Vec::new();
		let mut tasks: Vec<ReaderTask> = Vec::new();
		for group in &groups {
			let pairs = self.load_group(group);
			for (value, flags) in &pairs {
				tasks.push(ReaderTask {
					entry: value.clone(),
					point: *point,
					gps_time: group.gps_time,
					config: self.config.clone(),
				});
				if let Some(flags) = flags {
					tasks.push(ReaderTask {
						entry: flags.clone(),
						point: *point,
						gps_time: group.gps_time,
						config: self.config.clone(),
					});
				}
			}
			loaded.push((group.gps_time, pairs));
		}
		tile_cache().evict_over_limit();

		debug!("sampling {} tiles for {point:?} via '{}'", tasks.len(), self.key);
		reader_pool().dispatch_and_wait(&tasks, self.sample_timeout);

		// merge: flags samples fold into their value sample's flag word
		for (_group_time, pairs) in loaded {
			for (value_entry, flags_entry) in pairs {
				if let Some(error) = value_entry.take_error() {
					outcome.errors.push(SampleError {
						kind: failure_kind_of(&error),
						url: value_entry.url().to_string(),
						text: format!("{error:#}"),
					});
					continue;
				}
				let Some(mut sample) = value_entry.take_sample() else {
					continue; // outside this tile, or nodata
				};
				if let Some(flags_entry) = flags_entry {
					if let Some(flags_sample) = flags_entry.take_sample() {
						sample.flags = flags_sample.flags;
					}
				}
				sample.file_id = directory.assign(value_entry.url());
				outcome.samples.push(sample);
			}
		}
		Ok(outcome)
	}
}

/// The one-file shortcut: no index, no pool, one open raster.
pub struct SingleRaster {
	key: String,
	raster: GdalRaster,
	config: Arc<RequestConfig>,
}

impl SingleRaster {
	pub fn open(key: &str, location: &str, config: Arc<RequestConfig>) -> Result<SingleRaster> {
		Ok(SingleRaster {
			key: key.to_string(),
			raster: GdalRaster::open(location)?,
			config,
		})
	}
}

impl RasterSource for SingleRaster {
	fn key(&self) -> &str {
		&self.key
	}

	fn get_samples(&self, point: &GeoPoint, _gps: f64, directory: &FileDirectory) -> Result<SampleOutcome> {
		let mut outcome = SampleOutcome::default();
		let sampled = if self.config.zonal_stats {
			self
				.raster
				.sample_zonal(point, self.config.sampling_radius)?
				.map(|(value, stats)| {
					let mut sample = RasterSample::new(value, 0.0);
					sample.zonal = Some(stats);
					sample
				})
		} else if self.config.sampling_algo == SamplingAlgo::Nearest {
			self.raster.sample_nearest(point)?.map(|v| RasterSample::new(v, 0.0))
		} else {
			self
				.raster
				.sample_resampled(point, self.config.sampling_algo, self.config.sampling_radius)?
				.map(|v| RasterSample::new(v, 0.0))
		};

		if let Some(mut sample) = sampled {
			sample.file_id = directory.assign(self.raster.url());
			outcome.samples.push(sample);
		}
		Ok(outcome)
	}
}
