//! The per-granule subsetter.
//!
//! One subsetter serves one granule. It spawns one worker per selected
//! ground-track pair (up to six); each worker opens its array handles against
//! the shared granule context, joins them, computes the region subset, walks
//! the segment arrays forming extents, and posts batches of 256 extents to
//! the output queue. The last worker to finish posts the stream terminator.

use super::granule::GranuleName;
use super::records::*;
use super::region::RegionFilter;
use beamline_archive::{ALL_ROWS, Archive, ArrayHandle, GranuleContext, JoinStatus};
use beamline_core::config::RequestConfig;
use beamline_core::failure::FailureKind;
use beamline_core::msgq::Publisher;
use beamline_core::record::Record;
use beamline_core::types::{Blob, ExtentId};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Extents per posted batch.
pub const BATCH_SIZE: usize = 256;

/// How long one queue post may wait before the producer retries.
const POST_TIMEOUT: Duration = Duration::from_millis(1000);
/// Posts attempted per record before the worker gives up.
const POST_ATTEMPTS: usize = 600;

const LAT_PATH: &str = "geolocation/reference_photon_lat";
const LON_PATH: &str = "geolocation/reference_photon_lon";
const SEGMENT_ID_PATH: &str = "geolocation/segment_id";
const DISTANCE_PATH: &str = "geolocation/segment_dist_x";
const PHOTON_COUNT_PATH: &str = "geolocation/segment_ph_cnt";
const DELTA_TIME_PATH: &str = "geolocation/delta_time";
const HEIGHT_PATH: &str = "heights/h_mean";
const QUALITY_PATH: &str = "geolocation/surf_conf";

/// One granule subset request.
pub struct SubsetRequest {
	pub resource: String,
	pub config: Arc<RequestConfig>,
	pub output_queue: String,
	pub active: Arc<AtomicBool>,
}

/// Counters accumulated across pair workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubsetStats {
	pub segments_read: u32,
	pub extents_filtered: u32,
	pub extents_sent: u32,
	pub pairs_complete: u32,
}

/// The ground-track pairs a request selects: `track` 0 keeps all three
/// tracks, `pair` 0 keeps both members.
#[must_use]
pub fn selected_pairs(config: &RequestConfig) -> Vec<(u8, u8)> {
	itertools::iproduct!(1..=3u8, 0..2u8)
		.filter(|(track, _)| config.track == 0 || config.track == *track)
		.filter(|(_, pair)| config.pair == 0 || config.pair == pair + 1)
		.collect()
}

/// Group name of one pair within the granule tree.
#[must_use]
pub fn pair_group(track: u8, pair: u8) -> String {
	format!("gt{track}{}", if pair == 0 { 'l' } else { 'r' })
}

/// Spot number of a pair member.
#[must_use]
pub fn spot_of(track: u8, pair: u8) -> u8 {
	(track - 1) * 2 + pair + 1
}

/// Runs the subsetter to completion and returns the accumulated counters.
/// The output queue sees extent batches and exception records, then exactly
/// one terminator.
pub struct Subsetter;

impl Subsetter {
	pub fn run(request: &SubsetRequest) -> Result<SubsetStats> {
		register_pipeline_records();

		let name = GranuleName::parse(&request.resource);
		let context = GranuleContext::new();
		let pairs = selected_pairs(&request.config);
		let remaining = Arc::new(AtomicUsize::new(pairs.len()));
		let stats = Arc::new(Mutex::new(SubsetStats::default()));

		info!("subsetting '{}' across {} pairs", request.resource, pairs.len());

		let mut workers = Vec::with_capacity(pairs.len());
		for (track, pair) in pairs {
			let worker = PairWorker {
				resource: request.resource.clone(),
				config: request.config.clone(),
				output_queue: request.output_queue.clone(),
				active: request.active.clone(),
				context: context.clone(),
				name,
				track,
				pair,
				remaining: remaining.clone(),
				stats: stats.clone(),
			};
			workers.push(
				std::thread::Builder::new()
					.name(format!("subset-{}", pair_group(track, pair)))
					.spawn(move || worker.run())
					.context("while spawning a pair worker")?,
			);
		}
		for worker in workers {
			let _ = worker.join();
		}

		let totals = *stats.lock();
		info!(
			"subset of '{}' done: {} segments, {} extents sent, {} filtered",
			request.resource, totals.segments_read, totals.extents_sent, totals.extents_filtered
		);
		Ok(totals)
	}
}

struct PairWorker {
	resource: String,
	config: Arc<RequestConfig>,
	output_queue: String,
	active: Arc<AtomicBool>,
	context: Arc<GranuleContext>,
	name: GranuleName,
	track: u8,
	pair: u8,
	remaining: Arc<AtomicUsize>,
	stats: Arc<Mutex<SubsetStats>>,
}

impl PairWorker {
	fn run(&self) {
		let publisher = Publisher::new(&self.output_queue);
		let local = self.subset_pair(&publisher);

		let mut stats = self.stats.lock();
		if let Ok(local) = &local {
			stats.segments_read += local.segments_read;
			stats.extents_filtered += local.extents_filtered;
			stats.extents_sent += local.extents_sent;
		}
		stats.pairs_complete += 1;
		let totals = *stats;
		drop(stats);

		if let Err(error) = &local {
			warn!("pair {} of '{}' failed: {error:#}", pair_group(self.track, self.pair), self.resource);
			let kind = beamline_core::failure::failure_kind_of(error).unwrap_or(FailureKind::ResourceMissing);
			self.post_exception(&publisher, kind, &format!("{error:#}"));
		}

		// the last worker closes the stream
		if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
			if totals.extents_sent > 0 {
				if let Ok(record) = pack_stats(
					totals.segments_read,
					totals.extents_filtered,
					totals.extents_sent,
					totals.pairs_complete,
				) {
					self.post_with_retry(&publisher, record.serialize());
				}
			}
			if let Err(error) = publisher.post_terminator(Duration::from_secs(60)) {
				warn!("terminator post failed on '{}': {error:#}", self.output_queue);
			}
		}
	}

	fn subset_pair(&self, publisher: &Publisher) -> Result<SubsetStats> {
		let mut local = SubsetStats::default();
		let group = pair_group(self.track, self.pair);
		let archive = Arc::new(Archive::open(&self.resource, Some(self.context.clone()))?);

		// every column of the pair, read concurrently
		let open = |path: &str| ArrayHandle::new(archive.clone(), &format!("/{group}/{path}"), 0, 0, ALL_ROWS);
		let mut lat = open(LAT_PATH);
		let mut lon = open(LON_PATH);
		let mut segment_id = open(SEGMENT_ID_PATH);
		let mut distance = open(DISTANCE_PATH);
		let mut photons = open(PHOTON_COUNT_PATH);
		let mut delta_time = open(DELTA_TIME_PATH);
		let mut height = open(HEIGHT_PATH);
		let mut quality = open(QUALITY_PATH);
		let mut ancillary: Vec<(String, ArrayHandle)> = self
			.config
			.ancillary_columns
			.iter()
			.map(|column| (column.clone(), open(column)))
			.collect();

		let timeout = Duration::from_secs(self.config.read_timeout.max(1));
		{
			let mut joinable: Vec<&mut ArrayHandle> = vec![
				&mut lat,
				&mut lon,
				&mut segment_id,
				&mut distance,
				&mut photons,
				&mut delta_time,
				&mut height,
				&mut quality,
			];
			joinable.extend(ancillary.iter_mut().map(|(_, handle)| handle));
			for handle in joinable {
				match handle.join(timeout) {
					JoinStatus::Ok => {}
					JoinStatus::Timeout => {
						return Err(beamline_core::failure::failure(
							FailureKind::Timeout,
							format!("'{}' did not arrive within {timeout:?}", handle.path()),
						));
					}
					JoinStatus::Error => {
						let (kind, text) = handle.error().map(|(k, t)| (k, t.to_string())).unwrap_or_default();
						return Err(beamline_core::failure::failure(
							kind.unwrap_or(FailureKind::ResourceMissing),
							format!("'{}' failed: {text}", handle.path()),
						));
					}
				}
			}
		}

		// region subset, then trim every handle to the selected run
		let filter = RegionFilter::from_config(&self.config)?;
		let segments = lat.len().min(lon.len());
		let subset = filter.subset_range(segments, |segment| {
			(
				lon.value_f64(segment).unwrap_or(f64::NAN),
				lat.value_f64(segment).unwrap_or(f64::NAN),
			)
		});
		let Some((first_segment, num_segments)) = subset else {
			debug!("pair {group} has no segments in the region");
			return Ok(local);
		};
		for handle in [
			&mut lat,
			&mut lon,
			&mut segment_id,
			&mut distance,
			&mut photons,
			&mut delta_time,
			&mut height,
			&mut quality,
		] {
			handle.trim(first_segment);
		}
		for (_, handle) in &mut ancillary {
			handle.trim(first_segment);
		}
		local.segments_read = num_segments as u32;

		self.walk_segments(
			publisher,
			&mut local,
			num_segments,
			&lat,
			&lon,
			&segment_id,
			&distance,
			&photons,
			&delta_time,
			&height,
			&quality,
			&ancillary,
		)?;
		Ok(local)
	}

	#[allow(clippy::too_many_arguments)]
	fn walk_segments(
		&self,
		publisher: &Publisher,
		local: &mut SubsetStats,
		num_segments: usize,
		lat: &ArrayHandle,
		lon: &ArrayHandle,
		segment_id: &ArrayHandle,
		distance: &ArrayHandle,
		photons: &ArrayHandle,
		delta_time: &ArrayHandle,
		height: &ArrayHandle,
		quality: &ArrayHandle,
		ancillary: &[(String, ArrayHandle)],
	) -> Result<()> {
		let config = &self.config;
		let extent_id_base = ExtentId::pack(self.name.rgt, self.name.cycle, self.name.region, self.track, self.pair, 0, 0);
		let mut counter: u32 = 0;
		let mut batch: Vec<Record> = Vec::with_capacity(BATCH_SIZE);
		let mut batch_centers: Vec<usize> = Vec::with_capacity(BATCH_SIZE);

		let dist_at = |segment: usize| distance.value_f64(segment).unwrap_or(f64::NAN);

		let mut start = 0usize;
		while start < num_segments {
			if !self.active.load(Ordering::Acquire) {
				debug!("pair {} cancelled", pair_group(self.track, self.pair));
				break;
			}

			let start_dist = dist_at(start);
			let mut end = start;
			let mut photon_count: u32 = 0;
			while end < num_segments && dist_at(end) - start_dist < config.extent_length {
				let confident = quality.value_i64(end).unwrap_or(0) >= i64::from(config.signal_confidence);
				if confident {
					photon_count += photons.value_i64(end).unwrap_or(0).max(0) as u32;
				}
				end += 1;
			}

			let spread = if end > start { dist_at(end - 1) - start_dist } else { 0.0 };
			if photon_count >= config.photon_count && spread >= config.along_track_spread {
				let center = (start + end - 1) / 2;
				let values = ExtentValues {
					extent_id: extent_id_base.with_counter(counter),
					track: self.track,
					pair: self.pair,
					spot: spot_of(self.track, self.pair),
					quality: quality.value_i64(center).unwrap_or(0).max(0) as u32,
					segment_id: segment_id.value_i64(start).unwrap_or(0) as u32,
					lat: lat.value_f64(center).unwrap_or(f64::NAN),
					lon: lon.value_f64(center).unwrap_or(f64::NAN),
					gps_time: delta_time.value_f64(center).unwrap_or(0.0),
					distance: start_dist,
					height: height.value_f64(center).unwrap_or(f64::NAN),
					photon_count,
					spread,
				};
				counter += 1;
				batch.push(pack_extent(&values)?);
				batch_centers.push(center);

				if batch.len() >= BATCH_SIZE {
					self.flush_batch(publisher, local, &mut batch, &mut batch_centers, ancillary)?;
				}
			} else {
				local.extents_filtered += 1;
			}

			// advance by the configured step
			let previous = start;
			while start < num_segments && dist_at(start) - start_dist < config.extent_step {
				start += 1;
			}
			if start == previous {
				start += 1;
			}
		}

		if self.active.load(Ordering::Acquire) && !batch.is_empty() {
			self.flush_batch(publisher, local, &mut batch, &mut batch_centers, ancillary)?;
		}
		Ok(())
	}

	fn flush_batch(
		&self,
		publisher: &Publisher,
		local: &mut SubsetStats,
		batch: &mut Vec<Record>,
		centers: &mut Vec<usize>,
		ancillary: &[(String, ArrayHandle)],
	) -> Result<()> {
		let envelope = pack_extent_batch(batch)?;
		let record = if ancillary.is_empty() {
			envelope
		} else {
			let mut columns = Vec::with_capacity(ancillary.len());
			for (column, handle) in ancillary {
				let element_size = handle.data().map_or(8, |d| d.type_size());
				let mut bytes = vec![0u8; centers.len() * element_size];
				for (index, center) in centers.iter().enumerate() {
					// a short ancillary column contributes zeros for the tail
					let _ = handle.serialize(&mut bytes[index * element_size..(index + 1) * element_size], *center, 1);
				}
				columns.push(pack_ancillary(column, element_size, &bytes)?);
			}
			pack_batch_container(&envelope, &columns)?
		};

		if self.post_with_retry(publisher, record.serialize()) {
			local.extents_sent += batch.len() as u32;
		}
		batch.clear();
		centers.clear();
		Ok(())
	}

	fn post_with_retry(&self, publisher: &Publisher, bytes: Vec<u8>) -> bool {
		let blob = Blob::from(bytes);
		for _ in 0..POST_ATTEMPTS {
			if !self.active.load(Ordering::Acquire) {
				return false;
			}
			match publisher.post(blob.clone(), POST_TIMEOUT) {
				Ok(()) => return true,
				Err(_) => continue, // back-pressure: retry while the request is live
			}
		}
		warn!("giving up on a post to '{}' after {POST_ATTEMPTS} attempts", self.output_queue);
		false
	}

	fn post_exception(&self, publisher: &Publisher, kind: FailureKind, text: &str) {
		if let Ok(record) = pack_exception(kind, 3, text) {
			self.post_with_retry(publisher, record.serialize());
		}
	}
}
