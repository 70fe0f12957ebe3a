//! The sample dispatcher: extents in, samples out.
//!
//! Consumes the extent stream of one request, asks every attached raster
//! source for samples at each extent's point, and emits one sample-list
//! record per source per extent, keyed by extent id. When the extent stream
//! terminates, the dispatcher emits the file-directory record mapping every
//! assigned file id to its URL, then the terminator of its own stream.

use super::records::*;
use beamline_core::failure::FailureKind;
use beamline_core::msgq::{Publisher, Subscriber, SubscriberMode};
use beamline_core::record::{CONTAINER_RECORD_TYPE, Record, split_container_bytes};
use beamline_core::types::{Blob, ExtentId, GeoPoint};
use beamline_raster::{FileDirectory, RasterSource};
use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(1000);
const POST_TIMEOUT: Duration = Duration::from_millis(1000);
const POST_ATTEMPTS: usize = 600;

/// One dispatch request: where extents come from, where samples go, and the
/// sources to sample.
pub struct DispatchRequest {
	pub extent_queue: String,
	pub output_queue: String,
	pub sources: Vec<Arc<dyn RasterSource>>,
	pub active: Arc<AtomicBool>,
}

/// Counters of one dispatch run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
	pub extents_seen: u32,
	pub sample_records: u32,
	pub exceptions: u32,
}

pub struct SampleDispatcher;

impl SampleDispatcher {
	/// Runs until the extent stream terminates or the request is cancelled.
	pub fn run(request: &DispatchRequest) -> Result<DispatchStats> {
		register_pipeline_records();

		let subscriber = Subscriber::new(&request.extent_queue, SubscriberMode::Confidence);
		let publisher = Publisher::new(&request.output_queue);
		let directory = FileDirectory::new();
		let mut stats = DispatchStats::default();

		loop {
			if !request.active.load(Ordering::Acquire) {
				debug!("dispatch on '{}' cancelled", request.extent_queue);
				break;
			}
			let Some(message) = subscriber.receive(RECEIVE_TIMEOUT) else {
				continue; // timed out; re-check cancellation
			};
			if message.is_terminator() {
				break;
			}
			Self::handle_message(request, &publisher, &directory, &mut stats, message.as_slice());
		}

		if !directory.is_empty() {
			match pack_file_directory(&directory.snapshot()) {
				Ok(record) => {
					post_with_retry(&publisher, &request.active, record.serialize());
				}
				Err(error) => warn!("file directory packing failed: {error:#}"),
			}
		}
		if let Err(error) = publisher.post_terminator(Duration::from_secs(60)) {
			warn!("terminator post failed on '{}': {error:#}", request.output_queue);
		}

		info!(
			"dispatch of '{}' done: {} extents, {} sample records",
			request.extent_queue, stats.extents_seen, stats.sample_records
		);
		Ok(stats)
	}

	fn handle_message(
		request: &DispatchRequest,
		publisher: &Publisher,
		directory: &FileDirectory,
		stats: &mut DispatchStats,
		bytes: &[u8],
	) {
		let record = match Record::from_bytes(bytes) {
			Ok(record) => record,
			Err(error) => {
				warn!("unparseable record on '{}': {error:#}", request.extent_queue);
				return;
			}
		};

		let batch = match record.type_name() {
			EXTENT_BATCH_RECORD_TYPE => Some(record),
			CONTAINER_RECORD_TYPE => {
				// the first sub-record of a batch container is the extent
				// batch; ancillary columns ride along for downstream writers
				match split_container_bytes(bytes) {
					Ok(parts) => parts.first().and_then(|blob| Record::from_bytes(blob.as_slice()).ok()),
					Err(error) => {
						warn!("unparseable container on '{}': {error:#}", request.extent_queue);
						None
					}
				}
			}
			EXCEPTION_RECORD_TYPE => {
				// worker exceptions are forwarded unchanged
				stats.exceptions += 1;
				post_with_retry(publisher, &request.active, bytes.to_vec());
				None
			}
			_ => None, // statistics and other stream records are not sampled
		};
		let Some(batch) = batch else { return };

		let extents = match unpack_extent_batch(&batch) {
			Ok(extents) => extents,
			Err(error) => {
				warn!("bad extent batch on '{}': {error:#}", request.extent_queue);
				return;
			}
		};

		for extent in extents {
			if !request.active.load(Ordering::Acquire) {
				return;
			}
			stats.extents_seen += 1;
			Self::sample_extent(request, publisher, directory, stats, &extent);
		}
	}

	fn sample_extent(
		request: &DispatchRequest,
		publisher: &Publisher,
		directory: &FileDirectory,
		stats: &mut DispatchStats,
		extent: &Record,
	) {
		// typed field lookup through the record fabric
		let Ok(extent_id) = extent.get_integer("extent_id", 0) else {
			return;
		};
		let extent_id = ExtentId::from(extent_id as u64);
		let lon = extent.get_real("lon", 0).unwrap_or(f64::NAN);
		let lat = extent.get_real("lat", 0).unwrap_or(f64::NAN);
		let gps_time = extent.get_real("gps_time", 0).unwrap_or(0.0);
		let height = extent.get_real("height", 0).unwrap_or(0.0);
		if !lon.is_finite() || !lat.is_finite() {
			return;
		}
		let point = GeoPoint::with_height(lon, lat, height);

		for source in &request.sources {
			match source.get_samples(&point, gps_time, directory) {
				Ok(outcome) => {
					for error in &outcome.errors {
						let kind = error.kind.unwrap_or(FailureKind::ResourceMissing);
						if let Ok(record) = pack_exception(kind, 3, &format!("'{}': {}", error.url, error.text)) {
							stats.exceptions += 1;
							post_with_retry(publisher, &request.active, record.serialize());
						}
					}
					if !outcome.samples.is_empty() {
						match pack_samples(extent_id, source.key(), &outcome.samples) {
							Ok(record) => {
								if post_with_retry(publisher, &request.active, record.serialize()) {
									stats.sample_records += 1;
								}
							}
							Err(error) => warn!("sample packing failed: {error:#}"),
						}
					}
				}
				Err(error) => {
					warn!("source '{}' failed at {point:?}: {error:#}", source.key());
					let kind = beamline_core::failure::failure_kind_of(&error).unwrap_or(FailureKind::ResourceMissing);
					if let Ok(record) = pack_exception(kind, 3, &format!("{error:#}")) {
						stats.exceptions += 1;
						post_with_retry(publisher, &request.active, record.serialize());
					}
				}
			}
		}
	}
}

fn post_with_retry(publisher: &Publisher, active: &AtomicBool, bytes: Vec<u8>) -> bool {
	let blob = Blob::from(bytes);
	for _ in 0..POST_ATTEMPTS {
		if !active.load(Ordering::Acquire) {
			return false;
		}
		if publisher.post(blob.clone(), POST_TIMEOUT).is_ok() {
			return true;
		}
	}
	false
}

#[cfg(test)]
mod tests {
	use super::*;
	use beamline_core::msgq::release_queue;
	use beamline_core::types::ExtentId;
	use beamline_raster::{RasterSample, SampleError, SampleOutcome};

	/// A source that returns canned samples without touching any raster.
	struct CannedSource {
		key: String,
		value: f64,
		fail_with: Option<FailureKind>,
	}

	impl RasterSource for CannedSource {
		fn key(&self) -> &str {
			&self.key
		}

		fn get_samples(&self, point: &GeoPoint, gps: f64, directory: &FileDirectory) -> Result<SampleOutcome> {
			let mut outcome = SampleOutcome::default();
			if let Some(kind) = self.fail_with {
				outcome.errors.push(SampleError {
					kind: Some(kind),
					url: "mock://tile.tif".to_string(),
					text: "canned failure".to_string(),
				});
				return Ok(outcome);
			}
			let mut sample = RasterSample::new(self.value + point.lon * 0.0, gps);
			sample.file_id = directory.assign("mock://tile.tif");
			outcome.samples.push(sample);
			Ok(outcome)
		}
	}

	fn batch_of(extent_ids: &[u32]) -> Vec<u8> {
		let extents: Vec<Record> = extent_ids
			.iter()
			.map(|counter| {
				let values = ExtentValues {
					extent_id: ExtentId::pack(295, 1, 2, 1, 0, *counter, 0),
					track: 1,
					pair: 0,
					spot: 1,
					quality: 0,
					segment_id: *counter,
					lat: -75.0,
					lon: 145.0,
					gps_time: 1_000_000.0,
					distance: 0.0,
					height: 2000.0,
					photon_count: 50,
					spread: 35.0,
				};
				pack_extent(&values).unwrap()
			})
			.collect();
		pack_extent_batch(&extents).unwrap().serialize()
	}

	fn run_dispatch(tag: &str, source: CannedSource, payloads: Vec<Vec<u8>>) -> (DispatchStats, Vec<Record>) {
		let extent_queue = format!("testq.dispatch.in.{tag}");
		let output_queue = format!("testq.dispatch.out.{tag}");

		let out_sub = Subscriber::new(&output_queue, SubscriberMode::Confidence);
		let publisher = Publisher::new(&extent_queue);
		for payload in payloads {
			publisher.post(Blob::from(payload), Duration::from_millis(100)).unwrap();
		}
		publisher.post_terminator(Duration::from_millis(100)).unwrap();

		let request = DispatchRequest {
			extent_queue: extent_queue.clone(),
			output_queue: output_queue.clone(),
			sources: vec![Arc::new(source) as Arc<dyn RasterSource>],
			active: Arc::new(AtomicBool::new(true)),
		};
		let stats = SampleDispatcher::run(&request).unwrap();

		let mut records = Vec::new();
		while let Some(message) = out_sub.receive(Duration::from_millis(100)) {
			if message.is_terminator() {
				break;
			}
			records.push(Record::from_bytes(message.as_slice()).unwrap());
		}
		release_queue(&extent_queue);
		release_queue(&output_queue);
		(stats, records)
	}

	#[test]
	fn samples_every_extent_and_closes_with_the_directory() {
		let source = CannedSource {
			key: "mosaic".to_string(),
			value: 1234.5,
			fail_with: None,
		};
		let (stats, records) = run_dispatch("ok", source, vec![batch_of(&[0, 1, 2])]);

		assert_eq!(stats.extents_seen, 3);
		assert_eq!(stats.sample_records, 3);

		// three sample records, then the file directory container
		assert_eq!(records.len(), 4);
		for record in &records[..3] {
			assert_eq!(record.type_name(), SAMPLE_RECORD_TYPE);
			let samples = unpack_samples(record).unwrap();
			assert_eq!(samples.len(), 1);
			assert_eq!(samples[0].file_id, 1);
		}
		assert_eq!(records[3].type_name(), CONTAINER_RECORD_TYPE);
		let parts = split_container_bytes(records[3].as_bytes()).unwrap();
		assert_eq!(parts.len(), 1);
		let entry = Record::from_bytes(parts[0].as_slice()).unwrap();
		assert_eq!(entry.get_text("file_name").unwrap(), "mock://tile.tif");
	}

	#[test]
	fn sample_extent_ids_echo_the_extents() {
		let source = CannedSource {
			key: "dem".to_string(),
			value: 10.0,
			fail_with: None,
		};
		let (_, records) = run_dispatch("ids", source, vec![batch_of(&[7, 8])]);
		let expected: Vec<u64> = [7u32, 8]
			.iter()
			.map(|c| ExtentId::pack(295, 1, 2, 1, 0, *c, 0).0)
			.collect();
		let seen: Vec<u64> = records
			.iter()
			.filter(|r| r.type_name() == SAMPLE_RECORD_TYPE)
			.map(|r| r.get_integer("extent_id", 0).unwrap() as u64)
			.collect();
		assert_eq!(seen, expected);
	}

	#[test]
	fn per_tile_failures_become_exception_records() {
		let source = CannedSource {
			key: "broken".to_string(),
			value: 0.0,
			fail_with: Some(FailureKind::OutOfMemory),
		};
		let (stats, records) = run_dispatch("oom", source, vec![batch_of(&[0])]);

		assert_eq!(stats.sample_records, 0);
		assert_eq!(stats.exceptions, 1);
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].type_name(), EXCEPTION_RECORD_TYPE);
		assert_eq!(
			records[0].get_integer("code", 0).unwrap(),
			i64::from(FailureKind::OutOfMemory.code())
		);
	}

	#[test]
	fn empty_stream_yields_only_a_terminator() {
		let source = CannedSource {
			key: "idle".to_string(),
			value: 0.0,
			fail_with: None,
		};
		let (stats, records) = run_dispatch("empty", source, vec![]);
		assert_eq!(stats.extents_seen, 0);
		assert!(records.is_empty());
	}
}
