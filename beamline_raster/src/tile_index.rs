//! The raster tile index: a vector file of tile footprints.
//!
//! Each feature carries the tile's footprint polygon, acquisition time, value
//! raster URL, optional flags-raster sibling and optional group id. Tiles
//! sharing a group id must be sampled together; every filter below therefore
//! drops whole groups, never single tiles.

use beamline_core::config::RequestConfig;
use beamline_core::types::{GeoBBox, GeoPoint};
use anyhow::{Context, Result};
use gdal::Dataset;
use gdal::vector::{Geometry, LayerAccess};
use geo::Contains;
use log::warn;
use parking_lot::Mutex;

/// GPS epoch (1980-01-06T00:00:00Z) as a unix timestamp. Leap seconds are not
/// applied; tile timestamps are only ever compared against each other.
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Converts a unix timestamp to GPS seconds.
#[must_use]
pub fn unix_to_gps(unix: i64) -> f64 {
	(unix - GPS_EPOCH_UNIX) as f64
}

/// One tile index feature.
#[derive(Clone, Debug)]
pub struct TileEntry {
	pub footprint: geo_types::Geometry<f64>,
	/// Acquisition time, GPS seconds.
	pub gps_time: f64,
	pub url: String,
	pub flags_url: Option<String>,
	/// Explicit group id, or the tile's own URL when the index has none.
	pub group_id: String,
}

/// Tiles that must be sampled atomically. The group time is the minimum over
/// its member tiles.
#[derive(Clone, Debug)]
pub struct TileGroup {
	pub id: String,
	pub gps_time: f64,
	pub entries: Vec<TileEntry>,
}

/// An open tile index: the vector file, first layer authoritative.
pub struct TileIndex {
	dataset: Mutex<Dataset>,
	bbox: GeoBBox,
	name: String,
}

impl TileIndex {
	/// Opens the index and captures the layer's bounding box.
	pub fn open(location: &str) -> Result<TileIndex> {
		let dataset = Dataset::open(location).with_context(|| format!("while opening the tile index '{location}'"))?;
		let bbox = {
			let mut layer = dataset.layer(0).context("tile index has no layer")?;
			let envelope = layer.get_extent().context("while querying the index extent")?;
			GeoBBox::new(envelope.MinX, envelope.MinY, envelope.MaxX, envelope.MaxY)
		};
		Ok(TileIndex {
			dataset: Mutex::new(dataset),
			bbox,
			name: location.to_string(),
		})
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn bbox(&self) -> &GeoBBox {
		&self.bbox
	}

	/// All tiles whose footprint contains `point`, in index order.
	pub fn find_tiles(&self, point: &GeoPoint) -> Result<Vec<TileEntry>> {
		if !self.bbox.contains(point) {
			return Ok(Vec::new());
		}

		let dataset = self.dataset.lock();
		let mut layer = dataset.layer(0).context("tile index has no layer")?;
		let filter =
			Geometry::from_wkt(&format!("POINT({} {})", point.lon, point.lat)).context("while building the point filter")?;
		layer.set_spatial_filter(&filter);

		let query = geo_types::Point::new(point.lon, point.lat);
		let mut entries = Vec::new();
		for feature in layer.features() {
			let Some(geometry) = feature.geometry() else {
				continue;
			};
			let footprint = geometry.to_geo().context("while converting a tile footprint")?;
			if !footprint.contains(&query) {
				continue;
			}

			let Some(url) = feature.field_as_string_by_name("url")? else {
				warn!("tile feature without a url in '{}'", self.name);
				continue;
			};
			let gps_time = match feature.field_as_datetime_by_name("datetime")? {
				Some(datetime) => {
					if datetime.offset().local_minus_utc() != 0 {
						warn!("tile '{url}' carries a non-UTC timestamp");
					}
					unix_to_gps(datetime.timestamp())
				}
				None => {
					warn!("tile '{url}' carries no timestamp");
					0.0
				}
			};
			let flags_url = feature.field_as_string_by_name("flags_url").unwrap_or(None).filter(|u| !u.is_empty());
			let group_id = feature
				.field_as_string_by_name("group_id")
				.unwrap_or(None)
				.filter(|g| !g.is_empty())
				.unwrap_or_else(|| url.clone());

			entries.push(TileEntry {
				footprint,
				gps_time,
				url,
				flags_url,
				group_id,
			});
		}
		Ok(entries)
	}
}

/// Groups tiles by group id, preserving encounter order. The group time is
/// the minimum member time.
#[must_use]
pub fn group_tiles(entries: Vec<TileEntry>) -> Vec<TileGroup> {
	let mut groups: Vec<TileGroup> = Vec::new();
	for entry in entries {
		match groups.iter_mut().find(|g| g.id == entry.group_id) {
			Some(group) => {
				group.gps_time = group.gps_time.min(entry.gps_time);
				group.entries.push(entry);
			}
			None => groups.push(TileGroup {
				id: entry.group_id.clone(),
				gps_time: entry.gps_time,
				entries: vec![entry],
			}),
		}
	}
	groups
}

/// Applies the configured URL, temporal and closest-time filters,
/// group-atomically. `query_gps` is the query point's own time, used by the
/// closest-time filter.
#[must_use]
pub fn filter_groups(groups: Vec<TileGroup>, config: &RequestConfig, query_gps: Option<f64>) -> Vec<TileGroup> {
	let mut kept: Vec<TileGroup> = groups
		.into_iter()
		.filter(|group| {
			if let Some(substring) = &config.url_substring {
				let all_match = group
					.entries
					.iter()
					.all(|e| e.url.contains(substring.as_str()) && e.flags_url.as_ref().is_none_or(|f| f.contains(substring.as_str())));
				if !all_match {
					return false;
				}
			}
			if let Some(t0) = config.t0 {
				if group.gps_time < t0 {
					return false;
				}
			}
			if let Some(t1) = config.t1 {
				if group.gps_time > t1 {
					return false;
				}
			}
			true
		})
		.collect();

	if config.closest_time {
		if let Some(target) = query_gps {
			let min_delta = kept.iter().map(|g| (g.gps_time - target).abs()).fold(f64::INFINITY, f64::min);
			kept.retain(|g| (g.gps_time - target).abs() <= min_delta);
		}
	}
	kept
}

#[cfg(test)]
mod tests {
	use super::*;
	use geo_types::{Coord, LineString, Polygon};

	fn square(lon0: f64, lat0: f64, size: f64) -> geo_types::Geometry<f64> {
		Polygon::new(
			LineString::from(vec![
				Coord { x: lon0, y: lat0 },
				Coord { x: lon0 + size, y: lat0 },
				Coord {
					x: lon0 + size,
					y: lat0 + size,
				},
				Coord { x: lon0, y: lat0 + size },
				Coord { x: lon0, y: lat0 },
			]),
			vec![],
		)
		.into()
	}

	fn entry(url: &str, group: &str, gps: f64) -> TileEntry {
		TileEntry {
			footprint: square(-110.0, 40.0, 1.0),
			gps_time: gps,
			url: url.to_string(),
			flags_url: None,
			group_id: group.to_string(),
		}
	}

	#[test]
	fn grouping_uses_minimum_time() {
		let groups = group_tiles(vec![
			entry("a.tif", "g1", 200.0),
			entry("a_flags.tif", "g1", 100.0),
			entry("b.tif", "g2", 300.0),
		]);
		assert_eq!(groups.len(), 2);
		assert_eq!(groups[0].id, "g1");
		assert_eq!(groups[0].gps_time, 100.0);
		assert_eq!(groups[0].entries.len(), 2);
		assert_eq!(groups[1].id, "g2");
	}

	#[test]
	fn url_filter_is_group_atomic() {
		let config = RequestConfig {
			url_substring: Some("mosaic".to_string()),
			..RequestConfig::default()
		};
		let groups = group_tiles(vec![
			entry("dem_mosaic_1.tif", "g1", 0.0),
			entry("strip_1.tif", "g1", 0.0),
			entry("dem_mosaic_2.tif", "g2", 0.0),
		]);
		let kept = filter_groups(groups, &config, None);
		// one member of g1 fails the substring, so the whole group goes
		assert_eq!(kept.len(), 1);
		assert_eq!(kept[0].id, "g2");
	}

	#[test]
	fn temporal_window_uses_group_time() {
		let config = RequestConfig {
			t0: Some(100.0),
			t1: Some(200.0),
			..RequestConfig::default()
		};
		let groups = group_tiles(vec![
			entry("a.tif", "g1", 150.0),
			entry("b.tif", "g2", 250.0),
			entry("c.tif", "g3", 50.0),
		]);
		let kept = filter_groups(groups, &config, None);
		assert_eq!(kept.len(), 1);
		assert_eq!(kept[0].id, "g1");
	}

	#[test]
	fn closest_time_keeps_only_minimal_delta() {
		let config = RequestConfig {
			closest_time: true,
			..RequestConfig::default()
		};
		let groups = group_tiles(vec![
			entry("a.tif", "g1", 100.0),
			entry("b.tif", "g2", 180.0),
			entry("c.tif", "g3", 400.0),
		]);
		let kept = filter_groups(groups, &config, Some(200.0));
		assert_eq!(kept.len(), 1);
		assert_eq!(kept[0].id, "g2");
	}

	#[test]
	fn closest_time_with_no_groups_stays_empty() {
		let config = RequestConfig {
			closest_time: true,
			..RequestConfig::default()
		};
		let kept = filter_groups(Vec::new(), &config, Some(200.0));
		assert!(kept.is_empty());
	}

	#[test]
	fn no_filters_keeps_everything() {
		let config = RequestConfig::default();
		let groups = group_tiles(vec![entry("a.tif", "g1", 1.0), entry("b.tif", "g2", 2.0)]);
		assert_eq!(filter_groups(groups, &config, Some(5.0)).len(), 2);
	}

	#[test]
	fn footprint_containment() {
		let tile = entry("a.tif", "g1", 0.0);
		let inside = geo_types::Point::new(-109.5, 40.5);
		let outside = geo_types::Point::new(-108.5, 40.5);
		assert!(tile.footprint.contains(&inside));
		assert!(!tile.footprint.contains(&outside));
	}

	#[test]
	fn gps_conversion() {
		assert_eq!(unix_to_gps(GPS_EPOCH_UNIX), 0.0);
		assert_eq!(unix_to_gps(GPS_EPOCH_UNIX + 3600), 3600.0);
	}
}
