//! Geodetic point and bounding-box types shared between the subsetter and the
//! raster samplers. Coordinates are WGS84 degrees, `lon` before `lat`.

use serde::Deserialize;
use std::fmt;

/// A geodetic position with an optional height above the ellipsoid.
#[derive(Clone, Copy, PartialEq, Deserialize)]
pub struct GeoPoint {
	pub lon: f64,
	pub lat: f64,
	#[serde(default)]
	pub height: f64,
}

impl GeoPoint {
	#[must_use]
	pub fn new(lon: f64, lat: f64) -> Self {
		Self { lon, lat, height: 0.0 }
	}

	#[must_use]
	pub fn with_height(lon: f64, lat: f64, height: f64) -> Self {
		Self { lon, lat, height }
	}
}

impl fmt::Debug for GeoPoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "({:.6}, {:.6}, {:.3})", self.lon, self.lat, self.height)
	}
}

/// A lon/lat axis-aligned bounding box.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct GeoBBox {
	pub lon_min: f64,
	pub lat_min: f64,
	pub lon_max: f64,
	pub lat_max: f64,
}

impl GeoBBox {
	#[must_use]
	pub fn new(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Self {
		Self {
			lon_min,
			lat_min,
			lon_max,
			lat_max,
		}
	}

	#[must_use]
	pub fn contains(&self, point: &GeoPoint) -> bool {
		point.lon >= self.lon_min && point.lon <= self.lon_max && point.lat >= self.lat_min && point.lat <= self.lat_max
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bbox_containment() {
		let bbox = GeoBBox::new(-110.0, 40.0, -100.0, 50.0);
		assert!(bbox.contains(&GeoPoint::new(-105.0, 45.0)));
		assert!(bbox.contains(&GeoPoint::new(-110.0, 40.0)));
		assert!(!bbox.contains(&GeoPoint::new(-99.9, 45.0)));
		assert!(!bbox.contains(&GeoPoint::new(-105.0, 50.1)));
	}

	#[test]
	fn point_debug_is_compact() {
		let point = GeoPoint::with_height(-105.5, 44.25, 1500.0);
		assert_eq!(format!("{point:?}"), "(-105.500000, 44.250000, 1500.000)");
	}
}
