//! One open raster tile: dataset handle, geotransform, CRS transform and the
//! pixel/window read paths.

use super::sample::{ZonalStats, compute_zonal_stats};
use super::subset_pool::SubsetReservation;
use beamline_core::config::SamplingAlgo;
use beamline_core::types::GeoPoint;
use anyhow::{Context, Result};
use gdal::Dataset;
use gdal::raster::ResampleAlg;
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use log::debug;
use parking_lot::Mutex;

/// Maps a sampling algorithm to the library resampler.
#[must_use]
pub fn resample_alg_of(algo: SamplingAlgo) -> ResampleAlg {
	match algo {
		SamplingAlgo::Nearest => ResampleAlg::NearestNeighbour,
		SamplingAlgo::Bilinear => ResampleAlg::Bilinear,
		SamplingAlgo::Cubic => ResampleAlg::Cubic,
		SamplingAlgo::CubicSpline => ResampleAlg::CubicSpline,
		SamplingAlgo::Lanczos => ResampleAlg::Lanczos,
		SamplingAlgo::Average => ResampleAlg::Average,
		SamplingAlgo::Mode => ResampleAlg::Mode,
		SamplingAlgo::Gauss => ResampleAlg::Gauss,
	}
}

/// Default odd window edge for each resampler, used when no radius is set.
#[must_use]
pub fn default_kernel_of(algo: SamplingAlgo) -> usize {
	match algo {
		SamplingAlgo::Nearest => 1,
		SamplingAlgo::Bilinear | SamplingAlgo::Average | SamplingAlgo::Mode | SamplingAlgo::Gauss => 3,
		SamplingAlgo::Cubic | SamplingAlgo::CubicSpline => 5,
		SamplingAlgo::Lanczos => 7,
	}
}

/// Inverts an affine geotransform for one map coordinate, yielding fractional
/// pixel coordinates.
#[must_use]
pub(crate) fn pixel_of(geotransform: &[f64; 6], x: f64, y: f64) -> (f64, f64) {
	let det = geotransform[1] * geotransform[5] - geotransform[2] * geotransform[4];
	let dx = x - geotransform[0];
	let dy = y - geotransform[3];
	let px = (geotransform[5] * dx - geotransform[2] * dy) / det;
	let py = (geotransform[1] * dy - geotransform[4] * dx) / det;
	(px, py)
}

struct RasterInner {
	dataset: Dataset,
	/// Transform from WGS84 lon/lat into the tile's CRS, when they differ.
	to_tile: Option<CoordTransform>,
}

/// An open raster tile.
pub struct GdalRaster {
	inner: Mutex<RasterInner>,
	url: String,
	geotransform: [f64; 6],
	size: (usize, usize),
	nodata: Option<f64>,
}

impl GdalRaster {
	/// Opens a raster and captures its geotransform, size and nodata value.
	pub fn open(url: &str) -> Result<GdalRaster> {
		let dataset = Dataset::open(url).with_context(|| format!("while opening the raster '{url}'"))?;
		let geotransform = dataset.geo_transform().with_context(|| format!("raster '{url}' has no geotransform"))?;
		let size = dataset.raster_size();
		let nodata = dataset.rasterband(1).with_context(|| format!("raster '{url}' has no band"))?.no_data_value();

		// query points arrive as WGS84 lon/lat, traditional GIS axis order
		let to_tile = match dataset.spatial_ref() {
			Ok(tile_sr) => {
				let mut wgs84 = SpatialRef::from_epsg(4326).context("while building the WGS84 reference")?;
				wgs84.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
				let mut tile_sr = tile_sr;
				tile_sr.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
				if wgs84.to_wkt().ok() == tile_sr.to_wkt().ok() {
					None
				} else {
					Some(CoordTransform::new(&wgs84, &tile_sr).with_context(|| format!("no transform into the CRS of '{url}'"))?)
				}
			}
			Err(_) => {
				debug!("raster '{url}' carries no CRS; assuming lon/lat");
				None
			}
		};

		Ok(GdalRaster {
			inner: Mutex::new(RasterInner { dataset, to_tile }),
			url: url.to_string(),
			geotransform,
			size,
			nodata,
		})
	}

	#[must_use]
	pub fn url(&self) -> &str {
		&self.url
	}

	#[must_use]
	pub fn geotransform(&self) -> &[f64; 6] {
		&self.geotransform
	}

	#[must_use]
	pub fn cell_size(&self) -> (f64, f64) {
		(self.geotransform[1], self.geotransform[5])
	}

	fn is_nodata(&self, value: f64) -> bool {
		match self.nodata {
			Some(nodata) => value == nodata || (value.is_nan() && nodata.is_nan()),
			None => value.is_nan(),
		}
	}

	/// Projects a query point into the tile's CRS and returns fractional pixel
	/// coordinates, or `None` outside the raster.
	fn locate(&self, inner: &RasterInner, point: &GeoPoint) -> Result<Option<(f64, f64)>> {
		let (mut x, mut y) = (point.lon, point.lat);
		if let Some(transform) = &inner.to_tile {
			let mut xs = [x];
			let mut ys = [y];
			let mut zs = [0.0];
			transform
				.transform_coords(&mut xs, &mut ys, &mut zs)
				.with_context(|| format!("while projecting {point:?} into '{}'", self.url))?;
			x = xs[0];
			y = ys[0];
		}
		let (px, py) = pixel_of(&self.geotransform, x, y);
		if px < 0.0 || py < 0.0 || px >= self.size.0 as f64 || py >= self.size.1 as f64 {
			return Ok(None);
		}
		Ok(Some((px, py)))
	}

	fn read_window(&self, inner: &RasterInner, x0: isize, y0: isize, w: usize, h: usize) -> Result<Vec<f64>> {
		let band = inner.dataset.rasterband(1)?;
		let buffer = band
			.read_as::<f64>((x0, y0), (w, h), (w, h), None)
			.with_context(|| format!("while reading a {w}x{h} window of '{}'", self.url))?;
		Ok(buffer.data().to_vec())
	}

	/// Nearest-neighbour fast path: one pixel, decoded by data type.
	pub fn sample_nearest(&self, point: &GeoPoint) -> Result<Option<f64>> {
		let inner = self.inner.lock();
		let Some((px, py)) = self.locate(&inner, point)? else {
			return Ok(None);
		};
		let values = self.read_window(&inner, px as isize, py as isize, 1, 1)?;
		let value = values[0];
		Ok(if self.is_nodata(value) { None } else { Some(value) })
	}

	/// Resampled read: an odd window around the point collapsed to one value
	/// with the configured algorithm.
	pub fn sample_resampled(&self, point: &GeoPoint, algo: SamplingAlgo, radius_m: f64) -> Result<Option<f64>> {
		if algo == SamplingAlgo::Nearest {
			return self.sample_nearest(point);
		}
		let inner = self.inner.lock();
		let Some((px, py)) = self.locate(&inner, point)? else {
			return Ok(None);
		};

		let kernel = if radius_m > 0.0 {
			let cells = (2.0 * radius_m / self.geotransform[1].abs()).ceil() as usize;
			cells | 1 // odd-sized window
		} else {
			default_kernel_of(algo)
		};
		let half = kernel as isize / 2;
		let x0 = (px as isize - half).max(0);
		let y0 = (py as isize - half).max(0);
		let x1 = (px as isize + half + 1).min(self.size.0 as isize);
		let y1 = (py as isize + half + 1).min(self.size.1 as isize);
		if x0 >= x1 || y0 >= y1 {
			return Ok(None);
		}

		let band = inner.dataset.rasterband(1)?;
		let buffer = band
			.read_as::<f64>(
				(x0, y0),
				((x1 - x0) as usize, (y1 - y0) as usize),
				(1, 1),
				Some(resample_alg_of(algo)),
			)
			.with_context(|| format!("while resampling '{}'", self.url))?;
		let value = buffer.data()[0];
		Ok(if self.is_nodata(value) { None } else { Some(value) })
	}

	/// Windowed read with zonal statistics over a circular disc of
	/// `radius_m`, excluding nodata. Returns the centre value and the stats.
	/// The window's bytes are charged against the subset pool; exhaustion
	/// fails this one read.
	pub fn sample_zonal(&self, point: &GeoPoint, radius_m: f64) -> Result<Option<(f64, ZonalStats)>> {
		let inner = self.inner.lock();
		let Some((px, py)) = self.locate(&inner, point)? else {
			return Ok(None);
		};

		let cell_x = self.geotransform[1].abs();
		let cell_y = self.geotransform[5].abs();
		let rx = (radius_m / cell_x).ceil().max(1.0) as isize;
		let ry = (radius_m / cell_y).ceil().max(1.0) as isize;
		let x0 = (px as isize - rx).max(0);
		let y0 = (py as isize - ry).max(0);
		let x1 = (px as isize + rx + 1).min(self.size.0 as isize);
		let y1 = (py as isize + ry + 1).min(self.size.1 as isize);
		if x0 >= x1 || y0 >= y1 {
			return Ok(None);
		}
		let (w, h) = ((x1 - x0) as usize, (y1 - y0) as usize);

		let _reservation = SubsetReservation::reserve((w * h * std::mem::size_of::<f64>()) as u64)
			.with_context(|| format!("while reserving a {w}x{h} subset of '{}'", self.url))?;
		let values = self.read_window(&inner, x0, y0, w, h)?;

		let mut in_disc = Vec::new();
		for row in 0..h {
			for column in 0..w {
				let value = values[row * w + column];
				if self.is_nodata(value) {
					continue;
				}
				// distance from the query point to the cell centre, in map units
				let dx = (x0 + column as isize) as f64 + 0.5 - px;
				let dy = (y0 + row as isize) as f64 + 0.5 - py;
				let distance = ((dx * cell_x) * (dx * cell_x) + (dy * cell_y) * (dy * cell_y)).sqrt();
				if radius_m <= 0.0 || distance <= radius_m {
					in_disc.push(value);
				}
			}
		}

		let centre = values[(py as usize - y0 as usize) * w + (px as usize - x0 as usize)];
		if in_disc.is_empty() {
			return Ok(None);
		}
		let stats = compute_zonal_stats(&in_disc);
		let value = if self.is_nodata(centre) { stats.mean } else { centre };
		Ok(Some((value, stats)))
	}
}
