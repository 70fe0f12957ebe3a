//! Request configuration: the JSON parameter blob every request carries.
//!
//! One structure is shared by the subsetter, the raster samplers and the
//! fan-out proxy; unknown keys are ignored so older clients keep working.

use crate::types::GeoPoint;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Resampling algorithm for windowed raster sampling.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingAlgo {
	#[default]
	Nearest,
	Bilinear,
	Cubic,
	#[serde(rename = "cubicspline")]
	CubicSpline,
	Lanczos,
	Average,
	Mode,
	Gauss,
}

/// One raster source attached to a request, keyed so its samples can be told
/// apart on the output queue.
#[derive(Clone, Debug, Deserialize)]
pub struct RasterAttachment {
	/// Short key echoed in every sample record from this source.
	pub key: String,
	/// Vector index file for indexed sources, raster file for single sources.
	pub location: String,
	/// `true` when `location` is a single raster instead of an index.
	#[serde(default)]
	pub single: bool,
}

/// The request parameter blob.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
	/// 0 = all ground tracks, 1..=3 selects one.
	pub track: u8,
	/// 0 = both pair members, 1 = left only, 2 = right only.
	pub pair: u8,
	/// Minimum signal classification per photon.
	pub signal_confidence: i8,
	/// Minimum photons required to emit an extent.
	pub photon_count: u32,
	/// Minimum along-track span in metres required to emit an extent.
	pub along_track_spread: f64,
	/// Extent geometry in metres.
	pub extent_length: f64,
	pub extent_step: f64,
	/// Inclusion polygon as lon/lat vertices; empty means no polygon.
	pub polygon: Vec<GeoPoint>,
	/// Inclusion mask raster; overrides the polygon when set.
	pub raster_mask: Option<String>,
	/// Temporal window for tile filtering, GPS seconds.
	pub t0: Option<f64>,
	pub t1: Option<f64>,
	/// Keep only tiles nearest this GPS time (or the point's own time).
	pub closest_time: bool,
	/// Drop tiles whose URL lacks this substring.
	pub url_substring: Option<String>,
	pub sampling_algo: SamplingAlgo,
	/// Metres; zero means the algorithm-default kernel.
	pub sampling_radius: f64,
	/// Emit the larger zonal-stats sample variant.
	pub zonal_stats: bool,
	/// Seconds each array-handle join may take.
	pub read_timeout: u64,
	/// Extra per-segment columns joined and shipped alongside each batch.
	pub ancillary_columns: Vec<String>,
	/// Raster sources sampled for every extent.
	pub rasters: Vec<RasterAttachment>,
}

impl Default for RequestConfig {
	fn default() -> Self {
		Self {
			track: 0,
			pair: 0,
			signal_confidence: 4,
			photon_count: 10,
			along_track_spread: 20.0,
			extent_length: 40.0,
			extent_step: 20.0,
			polygon: Vec::new(),
			raster_mask: None,
			t0: None,
			t1: None,
			closest_time: false,
			url_substring: None,
			sampling_algo: SamplingAlgo::Nearest,
			sampling_radius: 0.0,
			zonal_stats: false,
			read_timeout: 600,
			ancillary_columns: Vec::new(),
			rasters: Vec::new(),
		}
	}
}

impl RequestConfig {
	/// Parses the JSON parameter blob.
	pub fn from_json(json: &str) -> Result<Self> {
		serde_json::from_str(json).context("while parsing the request parameter blob")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_the_documented_values() {
		let config = RequestConfig::default();
		assert_eq!(config.track, 0);
		assert_eq!(config.signal_confidence, 4);
		assert_eq!(config.photon_count, 10);
		assert_eq!(config.along_track_spread, 20.0);
		assert_eq!(config.extent_length, 40.0);
		assert_eq!(config.extent_step, 20.0);
		assert_eq!(config.read_timeout, 600);
		assert_eq!(config.sampling_algo, SamplingAlgo::Nearest);
		assert!(!config.zonal_stats);
	}

	#[test]
	fn parses_a_partial_blob() {
		let config = RequestConfig::from_json(
			r#"{
				"track": 2,
				"photon_count": 5,
				"polygon": [
					{"lon": -108.3, "lat": 38.9},
					{"lon": -107.8, "lat": 38.9},
					{"lon": -107.8, "lat": 39.1}
				],
				"sampling_algo": "bilinear",
				"rasters": [{"key": "mosaic", "location": "/vsis3/dems/index.geojson"}]
			}"#,
		)
		.unwrap();
		assert_eq!(config.track, 2);
		assert_eq!(config.photon_count, 5);
		assert_eq!(config.polygon.len(), 3);
		assert_eq!(config.sampling_algo, SamplingAlgo::Bilinear);
		assert_eq!(config.rasters.len(), 1);
		assert!(!config.rasters[0].single);
		// untouched keys keep their defaults
		assert_eq!(config.extent_length, 40.0);
	}

	#[test]
	fn unknown_keys_are_ignored() {
		let config = RequestConfig::from_json(r#"{"future_key": 1, "pair": 1}"#).unwrap();
		assert_eq!(config.pair, 1);
	}

	#[test]
	fn bad_json_is_an_error() {
		assert!(RequestConfig::from_json("{not json").is_err());
	}
}
