//! End-to-end runs of the subset pipeline against a synthetic granule
//! written to disk: archive resolution, lazy array joins, region subsetting,
//! extent batching and sample dispatch.

use beamline_core::config::RequestConfig;
use beamline_core::msgq::{Subscriber, SubscriberMode, release_queue};
use beamline_core::record::{CONTAINER_RECORD_TYPE, Record};
use beamline_core::types::GeoPoint;
use beamline_pipeline::*;
use beamline_raster::{FileDirectory, RasterSample, RasterSource, SampleOutcome};
use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Byte-level builder for a synthetic granule with version-2 headers and
/// contiguous datasets, 8-byte offsets and lengths.
#[derive(Default)]
struct GranuleBuilder {
	bytes: Vec<u8>,
}

impl GranuleBuilder {
	fn at(&self) -> u64 {
		self.bytes.len() as u64
	}

	fn superblock(&mut self) {
		assert!(self.bytes.is_empty());
		self.bytes.extend_from_slice(&[0x89, 0x48, 0x44, 0x46, 0x0D, 0x0A, 0x1A, 0x0A]);
		self.bytes.extend_from_slice(&[0; 5]);
		self.bytes.push(8); // offset size
		self.bytes.push(8); // length size
		self.bytes.push(0);
		self.bytes.extend_from_slice(&4u16.to_le_bytes());
		self.bytes.extend_from_slice(&16u16.to_le_bytes());
		self.bytes.extend_from_slice(&0u32.to_le_bytes());
		for _ in 0..4 {
			self.bytes.extend_from_slice(&0u64.to_le_bytes());
		}
		self.bytes.extend_from_slice(&0u64.to_le_bytes()); // root link name offset
		self.bytes.extend_from_slice(&0u64.to_le_bytes()); // root header address
		self.bytes.resize(96, 0);
	}

	fn object_header(&mut self, messages: &[Vec<u8>]) -> u64 {
		let address = self.at();
		let total: usize = messages.iter().map(|m| m.len()).sum();
		assert!(total < 256, "test headers must fit a 1-byte size field");
		self.bytes.extend_from_slice(b"OHDR");
		self.bytes.push(2);
		self.bytes.push(0);
		self.bytes.push(total as u8);
		for message in messages {
			self.bytes.extend_from_slice(message);
		}
		self.bytes.extend_from_slice(&0u32.to_le_bytes());
		address
	}

	fn patch_root(&mut self, address: u64) {
		self.bytes[64..72].copy_from_slice(&address.to_le_bytes());
	}

	/// Writes a contiguous dataset and returns its header address.
	fn dataset(&mut self, datatype_msg: Vec<u8>, element_size: usize, data: &[u8]) -> u64 {
		let data_address = self.at();
		self.bytes.extend_from_slice(data);
		let rows = (data.len() / element_size) as u64;

		let mut dataspace = vec![2u8, 1, 0, 0];
		dataspace.extend_from_slice(&rows.to_le_bytes());

		let mut layout = vec![3u8, 1];
		layout.extend_from_slice(&data_address.to_le_bytes());
		layout.extend_from_slice(&(data.len() as u64).to_le_bytes());

		self.object_header(&[message(0x01, &dataspace), message(0x03, &datatype_msg), message(0x08, &layout)])
	}

	fn group(&mut self, links: &[(&str, u64)]) -> u64 {
		let messages: Vec<Vec<u8>> = links
			.iter()
			.map(|(name, target)| {
				let mut body = vec![1u8, 0];
				body.push(name.len() as u8);
				body.extend_from_slice(name.as_bytes());
				body.extend_from_slice(&target.to_le_bytes());
				message(0x06, &body)
			})
			.collect();
		self.object_header(&messages)
	}
}

fn message(msg_type: u8, body: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(4 + body.len());
	out.push(msg_type);
	out.extend_from_slice(&(body.len() as u16).to_le_bytes());
	out.push(0);
	out.extend_from_slice(body);
	out
}

fn f64_type() -> Vec<u8> {
	let mut body = vec![0x11u8, 0, 0, 0];
	body.extend_from_slice(&8u32.to_le_bytes());
	body.extend_from_slice(&0u16.to_le_bytes());
	body.extend_from_slice(&64u16.to_le_bytes());
	body.extend_from_slice(&[52, 11, 0, 52]);
	body.extend_from_slice(&1023u32.to_le_bytes());
	body
}

fn i32_type() -> Vec<u8> {
	let mut body = vec![0x10u8, 0x08, 0, 0];
	body.extend_from_slice(&4u32.to_le_bytes());
	body.extend_from_slice(&0u16.to_le_bytes());
	body.extend_from_slice(&32u16.to_le_bytes());
	body
}

fn f64_bytes(values: impl Iterator<Item = f64>) -> Vec<u8> {
	values.flat_map(|v| v.to_le_bytes()).collect()
}

fn i32_bytes(values: impl Iterator<Item = i32>) -> Vec<u8> {
	values.flat_map(|v| v.to_le_bytes()).collect()
}

/// A granule with one ground-track pair (`gt1l`) of `segments` segments,
/// 20 m apart, 25 photons each, walking north from `lat0` along -105.0.
fn write_granule(segments: usize, lat0: f64) -> tempfile::NamedTempFile {
	let mut b = GranuleBuilder::default();
	b.superblock();

	let lat = b.dataset(f64_type(), 8, &f64_bytes((0..segments).map(|i| lat0 + i as f64 * 0.001)));
	let lon = b.dataset(f64_type(), 8, &f64_bytes((0..segments).map(|_| -105.0)));
	let segment_id = b.dataset(i32_type(), 4, &i32_bytes((0..segments).map(|i| 1000 + i as i32)));
	let dist = b.dataset(f64_type(), 8, &f64_bytes((0..segments).map(|i| i as f64 * 20.0)));
	let counts = b.dataset(i32_type(), 4, &i32_bytes((0..segments).map(|_| 25)));
	let time = b.dataset(f64_type(), 8, &f64_bytes((0..segments).map(|i| 1_000_000.0 + i as f64 * 0.003)));
	let conf = b.dataset(i32_type(), 4, &i32_bytes((0..segments).map(|_| 4)));
	let height = b.dataset(f64_type(), 8, &f64_bytes((0..segments).map(|i| 2400.0 + i as f64 * 0.1)));

	let geolocation = b.group(&[
		("reference_photon_lat", lat),
		("reference_photon_lon", lon),
		("segment_id", segment_id),
		("segment_dist_x", dist),
		("segment_ph_cnt", counts),
		("delta_time", time),
		("surf_conf", conf),
	]);
	let heights = b.group(&[("h_mean", height)]);
	let gt1l = b.group(&[("geolocation", geolocation), ("heights", heights)]);
	let root = b.group(&[("gt1l", gt1l)]);
	b.patch_root(root);

	let mut file = tempfile::NamedTempFile::new().unwrap();
	file.write_all(&b.bytes).unwrap();
	file
}

fn box_around(lat_min: f64, lat_max: f64) -> Vec<GeoPoint> {
	vec![
		GeoPoint::new(-106.0, lat_min),
		GeoPoint::new(-104.0, lat_min),
		GeoPoint::new(-104.0, lat_max),
		GeoPoint::new(-106.0, lat_max),
	]
}

fn drain_records(subscriber: &Subscriber) -> (Vec<Record>, bool) {
	let mut records = Vec::new();
	let mut terminated = false;
	while let Some(message) = subscriber.receive(Duration::from_millis(500)) {
		if message.is_terminator() {
			terminated = true;
			break;
		}
		records.push(Record::from_bytes(message.as_slice()).unwrap());
	}
	(records, terminated)
}

fn subset_request(resource: &str, queue: &str, config: RequestConfig) -> SubsetRequest {
	SubsetRequest {
		resource: resource.to_string(),
		config: Arc::new(config),
		output_queue: queue.to_string(),
		active: Arc::new(AtomicBool::new(true)),
	}
}

#[test]
fn polygon_subset_emits_filtered_ascending_extents() {
	let granule = write_granule(1000, 39.0);
	let queue = "itest.subset.polygon";
	let subscriber = Subscriber::new(queue, SubscriberMode::Confidence);

	let config = RequestConfig {
		track: 1,
		pair: 1, // left member only
		polygon: box_around(39.1, 39.2),
		photon_count: 10,
		along_track_spread: 10.0,
		extent_length: 40.0,
		extent_step: 20.0,
		..RequestConfig::default()
	};
	let request = subset_request(granule.path().to_str().unwrap(), queue, config);
	let stats = Subsetter::run(&request).unwrap();
	assert!(stats.extents_sent > 0);

	let (records, terminated) = drain_records(&subscriber);
	assert!(terminated);

	let mut last_segment = 0i64;
	let mut last_counter: Option<u32> = None;
	let mut extent_count = 0;
	for record in &records {
		if record.type_name() != EXTENT_BATCH_RECORD_TYPE {
			continue;
		}
		for extent in unpack_extent_batch(record).unwrap() {
			extent_count += 1;
			assert!(extent.get_integer("photon_count", 0).unwrap() >= 10);
			assert!(extent.get_real("spread", 0).unwrap() >= 10.0);
			// latitudes stay inside the polygon band
			let lat = extent.get_real("lat", 0).unwrap();
			assert!(lat > 39.09 && lat < 39.21, "extent latitude {lat} outside the polygon");
			// strictly ascending segments and densely increasing counters
			let segment = extent.get_integer("segment_id", 0).unwrap();
			assert!(segment > last_segment);
			last_segment = segment;
			let id = beamline_core::types::ExtentId::from(extent.get_integer("extent_id", 0).unwrap() as u64);
			if let Some(previous) = last_counter {
				assert_eq!(id.counter(), previous + 1);
			}
			last_counter = Some(id.counter());
		}
	}
	assert_eq!(extent_count, stats.extents_sent);
	release_queue(queue);
}

#[test]
fn disjoint_polygon_yields_zero_records_and_one_terminator() {
	let granule = write_granule(200, 39.0);
	let queue = "itest.subset.empty";
	let subscriber = Subscriber::new(queue, SubscriberMode::Confidence);

	let config = RequestConfig {
		track: 1,
		pair: 1,
		polygon: box_around(-50.0, -49.0), // other hemisphere
		..RequestConfig::default()
	};
	let request = subset_request(granule.path().to_str().unwrap(), queue, config);
	let stats = Subsetter::run(&request).unwrap();
	assert_eq!(stats.extents_sent, 0);

	let (records, terminated) = drain_records(&subscriber);
	assert!(terminated);
	assert!(records.is_empty(), "an empty subset posts no data records");
	// nothing may follow the terminator
	assert!(subscriber.receive(Duration::from_millis(100)).is_none());
	release_queue(queue);
}

#[test]
fn cancellation_stops_the_stream_after_the_terminator() {
	let granule = write_granule(500, 39.0);
	let queue = "itest.subset.cancel";
	let subscriber = Subscriber::new(queue, SubscriberMode::Confidence);

	let request = SubsetRequest {
		resource: granule.path().to_str().unwrap().to_string(),
		config: Arc::new(RequestConfig {
			track: 1,
			pair: 1,
			..RequestConfig::default()
		}),
		output_queue: queue.to_string(),
		active: Arc::new(AtomicBool::new(false)), // cancelled up front
	};
	let stats = Subsetter::run(&request).unwrap();
	assert_eq!(stats.extents_sent, 0);

	let (records, terminated) = drain_records(&subscriber);
	assert!(terminated);
	assert!(records.is_empty());
	assert!(subscriber.receive(Duration::from_millis(100)).is_none());
	release_queue(queue);
}

/// A raster source that answers every point with one canned sample.
struct FlatSource;

impl RasterSource for FlatSource {
	fn key(&self) -> &str {
		"flat"
	}

	fn get_samples(&self, _point: &GeoPoint, gps: f64, directory: &FileDirectory) -> Result<SampleOutcome> {
		let mut outcome = SampleOutcome::default();
		let mut sample = RasterSample::new(1500.25, gps);
		sample.file_id = directory.assign("mock://flat.tif");
		outcome.samples.push(sample);
		Ok(outcome)
	}
}

#[test]
fn dispatch_links_every_sample_to_an_emitted_extent() {
	let granule = write_granule(600, 39.0);
	let extent_queue = "itest.pipeline.extents";
	let sample_queue = "itest.pipeline.samples";
	let extent_tap = Subscriber::new(extent_queue, SubscriberMode::Confidence);
	let sample_tap = Subscriber::new(sample_queue, SubscriberMode::Confidence);

	let config = RequestConfig {
		track: 1,
		pair: 1,
		polygon: box_around(39.05, 39.35),
		..RequestConfig::default()
	};
	let request = subset_request(granule.path().to_str().unwrap(), extent_queue, config);

	let active = request.active.clone();
	let dispatch = std::thread::spawn(move || {
		SampleDispatcher::run(&DispatchRequest {
			extent_queue: extent_queue.to_string(),
			output_queue: sample_queue.to_string(),
			sources: vec![Arc::new(FlatSource)],
			active,
		})
	});

	let stats = Subsetter::run(&request).unwrap();
	assert!(stats.extents_sent > 0);
	let dispatch_stats = dispatch.join().unwrap().unwrap();
	assert_eq!(dispatch_stats.extents_seen, stats.extents_sent);

	// collect the extent ids actually emitted
	let (extent_records, _) = drain_records(&extent_tap);
	let mut emitted = std::collections::HashSet::new();
	for record in &extent_records {
		if record.type_name() == EXTENT_BATCH_RECORD_TYPE {
			for extent in unpack_extent_batch(record).unwrap() {
				emitted.insert(extent.get_integer("extent_id", 0).unwrap());
			}
		}
	}

	// every sample references an emitted extent; the directory closes the stream
	let (sample_records, terminated) = drain_records(&sample_tap);
	assert!(terminated);
	let mut sample_count = 0;
	let mut saw_directory = false;
	for record in &sample_records {
		match record.type_name() {
			SAMPLE_RECORD_TYPE => {
				sample_count += 1;
				assert!(emitted.contains(&record.get_integer("extent_id", 0).unwrap()));
				let samples = unpack_samples(record).unwrap();
				assert_eq!(samples.len(), 1);
				assert_eq!(samples[0].file_id, 1);
			}
			CONTAINER_RECORD_TYPE => saw_directory = true,
			other => panic!("unexpected record type '{other}'"),
		}
	}
	assert_eq!(sample_count, stats.extents_sent);
	assert!(saw_directory, "the file directory must trail the samples");

	release_queue(extent_queue);
	release_queue(sample_queue);
}
