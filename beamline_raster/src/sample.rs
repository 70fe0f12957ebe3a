//! Sample values and zonal statistics.

/// Summary statistics of raster values within a circular window.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct ZonalStats {
	pub count: u32,
	pub min: f64,
	pub max: f64,
	pub mean: f64,
	pub median: f64,
	pub stdev: f64,
	/// Median absolute deviation.
	pub mad: f64,
}

/// One sampled value from one tile.
#[derive(Clone, PartialEq, Debug)]
pub struct RasterSample {
	pub value: f64,
	/// Tile acquisition time, GPS seconds.
	pub time: f64,
	/// Dense per-request id of the contributing tile.
	pub file_id: u64,
	pub flags: u32,
	pub zonal: Option<ZonalStats>,
}

impl RasterSample {
	#[must_use]
	pub fn new(value: f64, time: f64) -> Self {
		Self {
			value,
			time,
			file_id: 0,
			flags: 0,
			zonal: None,
		}
	}
}

/// Computes zonal statistics over the values of one window. Nodata exclusion
/// happens before this call; an empty slice yields a zeroed result.
#[must_use]
pub fn compute_zonal_stats(values: &[f64]) -> ZonalStats {
	if values.is_empty() {
		return ZonalStats::default();
	}
	let count = values.len();
	let mut min = f64::MAX;
	let mut max = f64::MIN;
	let mut sum = 0.0;
	for &value in values {
		min = min.min(value);
		max = max.max(value);
		sum += value;
	}
	let mean = sum / count as f64;

	let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
	let stdev = variance.sqrt();

	let median = median_of(values.to_vec());
	let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
	let mad = median_of(deviations);

	ZonalStats {
		count: count as u32,
		min,
		max,
		mean,
		median,
		stdev,
		mad,
	}
}

/// Median via partial sort.
fn median_of(mut values: Vec<f64>) -> f64 {
	let len = values.len();
	let mid = len / 2;
	let (_, upper_mid, _) = values.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap());
	let upper = *upper_mid;
	if len % 2 == 1 {
		upper
	} else {
		// even count: the mean of the two middle values
		let (_, lower_mid, _) = values.select_nth_unstable_by(mid - 1, |a, b| a.partial_cmp(b).unwrap());
		(upper + *lower_mid) / 2.0
	}
}
