//! Region subsetting: deciding which contiguous run of segments a worker
//! keeps.
//!
//! A configured polygon is projected once, with a polar stereographic
//! projection beyond ±70° latitude (the first polygon point decides) and
//! plate carrée elsewhere. Projecting before the point-in-polygon walk keeps
//! polygons that cross the antimeridian contiguous, so both hemispheres'
//! segments are found. A raster mask is the alternative: inclusion is a
//! nearest-neighbour lookup. With neither, everything is included.

use beamline_core::config::RequestConfig;
use beamline_core::types::GeoPoint;
use beamline_raster::GdalRaster;
use anyhow::{Context, Result};
use geo::Contains;
use geo_types::{Coord, LineString, Point, Polygon};

/// How polygon coordinates are flattened before containment tests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Projection {
	PlateCarree,
	NorthPolar,
	SouthPolar,
}

impl Projection {
	/// Picked by the first polygon vertex, matching the subsetter contract.
	#[must_use]
	pub fn for_polygon(polygon: &[GeoPoint]) -> Projection {
		match polygon.first() {
			Some(first) if first.lat > 70.0 => Projection::NorthPolar,
			Some(first) if first.lat < -70.0 => Projection::SouthPolar,
			_ => Projection::PlateCarree,
		}
	}
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Projects one lon/lat coordinate.
#[must_use]
pub fn project(point: &GeoPoint, projection: Projection) -> (f64, f64) {
	match projection {
		Projection::PlateCarree => (point.lon, point.lat),
		Projection::NorthPolar => {
			let t = (std::f64::consts::FRAC_PI_4 - point.lat.to_radians() / 2.0).tan();
			let lon = point.lon.to_radians();
			(2.0 * EARTH_RADIUS_M * t * lon.sin(), -2.0 * EARTH_RADIUS_M * t * lon.cos())
		}
		Projection::SouthPolar => {
			let t = (std::f64::consts::FRAC_PI_4 + point.lat.to_radians() / 2.0).tan();
			let lon = point.lon.to_radians();
			(2.0 * EARTH_RADIUS_M * t * lon.sin(), 2.0 * EARTH_RADIUS_M * t * lon.cos())
		}
	}
}

/// The inclusion test a subsetter worker applies to segment coordinates.
pub enum RegionFilter {
	All,
	Polygon {
		projection: Projection,
		projected: Polygon<f64>,
	},
	Mask(GdalRaster),
}

impl RegionFilter {
	/// Builds the filter from the request configuration. The raster mask
	/// overrides the polygon when both are set.
	pub fn from_config(config: &RequestConfig) -> Result<RegionFilter> {
		if let Some(mask) = &config.raster_mask {
			let raster = GdalRaster::open(mask).with_context(|| format!("while opening the region mask '{mask}'"))?;
			return Ok(RegionFilter::Mask(raster));
		}
		if config.polygon.len() >= 3 {
			let projection = Projection::for_polygon(&config.polygon);
			let mut ring: Vec<Coord<f64>> = config
				.polygon
				.iter()
				.map(|p| {
					let (x, y) = project(p, projection);
					Coord { x, y }
				})
				.collect();
			if ring.first() != ring.last() {
				ring.push(ring[0]);
			}
			return Ok(RegionFilter::Polygon {
				projection,
				projected: Polygon::new(LineString::from(ring), vec![]),
			});
		}
		Ok(RegionFilter::All)
	}

	/// Whether a segment at `(lon, lat)` is included.
	pub fn includes(&self, lon: f64, lat: f64) -> bool {
		match self {
			RegionFilter::All => true,
			RegionFilter::Polygon { projection, projected } => {
				let (x, y) = project(&GeoPoint::new(lon, lat), *projection);
				projected.contains(&Point::new(x, y))
			}
			RegionFilter::Mask(raster) => matches!(raster.sample_nearest(&GeoPoint::new(lon, lat)), Ok(Some(_))),
		}
	}

	/// Walks the coordinate arrays to the first included index, then forward
	/// to the first excluded one, yielding `(first_segment, num_segments)`.
	/// `None` when nothing is included.
	pub fn subset_range<F>(&self, len: usize, coord_at: F) -> Option<(usize, usize)>
	where
		F: Fn(usize) -> (f64, f64),
	{
		if matches!(self, RegionFilter::All) {
			return if len == 0 { None } else { Some((0, len)) };
		}

		let mut first = None;
		for segment in 0..len {
			let (lon, lat) = coord_at(segment);
			let inside = self.includes(lon, lat);
			match first {
				None if inside => first = Some(segment),
				Some(start) if !inside => return Some((start, segment - start)),
				_ => {}
			}
		}
		first.map(|start| (start, len - start))
	}
}
