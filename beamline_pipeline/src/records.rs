//! Record definitions of the pipeline's wire types, registered once per
//! process, plus the pack/unpack helpers for batched tails.
//!
//! Extents inside a batch are raw fixed-width bodies, so a batch of `k`
//! extents serializes to exactly `k * EXTENT_SIZE` bytes behind the envelope
//! header.

use beamline_core::failure::{FailureKind, failure};
use beamline_core::record::{
	FLAG_NATIVE, FieldDef, FieldType, Record, define_record, pack_container, register_container_record,
};
use beamline_core::types::ExtentId;
use beamline_raster::{RasterSample, ZonalStats};
use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Once;

pub const EXTENT_RECORD_TYPE: &str = "extrec";
pub const EXTENT_BATCH_RECORD_TYPE: &str = "extbatch";
pub const ANCILLARY_RECORD_TYPE: &str = "ancrec";
pub const EXCEPTION_RECORD_TYPE: &str = "exceptrec";
pub const SAMPLE_RECORD_TYPE: &str = "samplerec";
pub const ZONAL_SAMPLE_RECORD_TYPE: &str = "zsamplerec";
pub const FILE_DIRECTORY_RECORD_TYPE: &str = "filedirrec";
pub const STATS_RECORD_TYPE: &str = "subsetstats";

/// Serialized size of one extent body inside a batch.
pub const EXTENT_SIZE: usize = 80;

/// Serialized size of one plain sample entry in a sample record tail.
pub const SAMPLE_ENTRY_SIZE: usize = 32;
/// Serialized size of one zonal sample entry.
pub const ZONAL_ENTRY_SIZE: usize = 80;

static REGISTER: Once = Once::new();

/// Registers every pipeline record type. Idempotent and safe under
/// concurrent first-touch.
pub fn register_pipeline_records() {
	REGISTER.call_once(|| {
		register_container_record();

		let extent_fields = vec![
			FieldDef::new("extent_id", FieldType::UInt64, 0, 1, FLAG_NATIVE),
			FieldDef::new("rgt", FieldType::UInt16, 8, 1, FLAG_NATIVE),
			FieldDef::new("cycle", FieldType::UInt8, 10, 1, FLAG_NATIVE),
			FieldDef::new("region", FieldType::UInt8, 11, 1, FLAG_NATIVE),
			FieldDef::new("track", FieldType::UInt8, 12, 1, FLAG_NATIVE),
			FieldDef::new("pair", FieldType::UInt8, 13, 1, FLAG_NATIVE),
			FieldDef::new("spot", FieldType::UInt8, 14, 1, FLAG_NATIVE),
			FieldDef::new("quality", FieldType::UInt32, 16, 1, FLAG_NATIVE),
			FieldDef::new("segment_id", FieldType::UInt32, 20, 1, FLAG_NATIVE),
			FieldDef::new("lat", FieldType::Double, 24, 1, FLAG_NATIVE),
			FieldDef::new("lon", FieldType::Double, 32, 1, FLAG_NATIVE),
			FieldDef::new("gps_time", FieldType::Double, 40, 1, FLAG_NATIVE),
			FieldDef::new("distance", FieldType::Double, 48, 1, FLAG_NATIVE),
			FieldDef::new("height", FieldType::Double, 56, 1, FLAG_NATIVE),
			FieldDef::new("photon_count", FieldType::UInt32, 64, 1, FLAG_NATIVE),
			FieldDef::new("spread", FieldType::Double, 72, 1, FLAG_NATIVE),
		];
		define_record(EXTENT_RECORD_TYPE, Some("extent_id"), EXTENT_SIZE, &extent_fields).expect("extent record");

		let batch_fields = vec![FieldDef::new("count", FieldType::UInt32, 0, 1, FLAG_NATIVE)];
		define_record(EXTENT_BATCH_RECORD_TYPE, None, 4, &batch_fields).expect("extent batch record");

		let ancillary_fields = vec![
			FieldDef::new("column", FieldType::Str, 0, 32, FLAG_NATIVE),
			FieldDef::new("element_size", FieldType::UInt32, 32, 1, FLAG_NATIVE),
			FieldDef::new("count", FieldType::UInt32, 36, 1, FLAG_NATIVE),
		];
		define_record(ANCILLARY_RECORD_TYPE, None, 40, &ancillary_fields).expect("ancillary record");

		let exception_fields = vec![
			FieldDef::new("code", FieldType::Int32, 0, 1, FLAG_NATIVE),
			FieldDef::new("level", FieldType::Int32, 4, 1, FLAG_NATIVE),
			FieldDef::new("text", FieldType::Str, 8, 128, FLAG_NATIVE),
		];
		define_record(EXCEPTION_RECORD_TYPE, Some("code"), 136, &exception_fields).expect("exception record");

		let sample_fields = vec![
			FieldDef::new("extent_id", FieldType::UInt64, 0, 1, FLAG_NATIVE),
			FieldDef::new("key", FieldType::Str, 8, 16, FLAG_NATIVE),
			FieldDef::new("count", FieldType::UInt32, 24, 1, FLAG_NATIVE),
		];
		define_record(SAMPLE_RECORD_TYPE, Some("extent_id"), 32, &sample_fields).expect("sample record");
		define_record(ZONAL_SAMPLE_RECORD_TYPE, Some("extent_id"), 32, &sample_fields).expect("zonal sample record");

		let file_fields = vec![
			FieldDef::new("file_id", FieldType::UInt64, 0, 1, FLAG_NATIVE),
			FieldDef::new("file_name", FieldType::Str, 8, 0, FLAG_NATIVE),
		];
		define_record(FILE_DIRECTORY_RECORD_TYPE, Some("file_id"), 8, &file_fields).expect("file directory record");

		let stats_fields = vec![
			FieldDef::new("segments_read", FieldType::UInt32, 0, 1, FLAG_NATIVE),
			FieldDef::new("extents_filtered", FieldType::UInt32, 4, 1, FLAG_NATIVE),
			FieldDef::new("extents_sent", FieldType::UInt32, 8, 1, FLAG_NATIVE),
			FieldDef::new("pairs_complete", FieldType::UInt32, 12, 1, FLAG_NATIVE),
		];
		define_record(STATS_RECORD_TYPE, None, 16, &stats_fields).expect("stats record");
	});
}

/// The values of one extent, before packing.
#[derive(Clone, Copy, Debug)]
pub struct ExtentValues {
	pub extent_id: ExtentId,
	pub track: u8,
	pub pair: u8,
	pub spot: u8,
	pub quality: u32,
	pub segment_id: u32,
	pub lat: f64,
	pub lon: f64,
	pub gps_time: f64,
	pub distance: f64,
	pub height: f64,
	pub photon_count: u32,
	pub spread: f64,
}

/// Builds one extent record.
pub fn pack_extent(values: &ExtentValues) -> Result<Record> {
	register_pipeline_records();
	let mut record = Record::new(EXTENT_RECORD_TYPE)?;
	record.set_integer("extent_id", 0, values.extent_id.0 as i64)?;
	record.set_integer("rgt", 0, i64::from(values.extent_id.rgt()))?;
	record.set_integer("cycle", 0, i64::from(values.extent_id.cycle()))?;
	record.set_integer("region", 0, i64::from(values.extent_id.region()))?;
	record.set_integer("track", 0, i64::from(values.track))?;
	record.set_integer("pair", 0, i64::from(values.pair))?;
	record.set_integer("spot", 0, i64::from(values.spot))?;
	record.set_integer("quality", 0, i64::from(values.quality))?;
	record.set_integer("segment_id", 0, i64::from(values.segment_id))?;
	record.set_real("lat", 0, values.lat)?;
	record.set_real("lon", 0, values.lon)?;
	record.set_real("gps_time", 0, values.gps_time)?;
	record.set_real("distance", 0, values.distance)?;
	record.set_real("height", 0, values.height)?;
	record.set_integer("photon_count", 0, i64::from(values.photon_count))?;
	record.set_real("spread", 0, values.spread)?;
	Ok(record)
}

/// Packs extent bodies into one batch envelope. The tail is exactly
/// `extents.len() * EXTENT_SIZE` bytes.
pub fn pack_extent_batch(extents: &[Record]) -> Result<Record> {
	register_pipeline_records();
	let mut batch = Record::with_data_size(EXTENT_BATCH_RECORD_TYPE, 4 + extents.len() * EXTENT_SIZE)?;
	batch.set_integer("count", 0, extents.len() as i64)?;
	let body = batch.data_mut();
	for (index, extent) in extents.iter().enumerate() {
		let at = 4 + index * EXTENT_SIZE;
		body[at..at + EXTENT_SIZE].copy_from_slice(extent.data());
	}
	Ok(batch)
}

/// Splits a batch back into full extent records.
pub fn unpack_extent_batch(batch: &Record) -> Result<Vec<Record>> {
	register_pipeline_records();
	if batch.type_name() != EXTENT_BATCH_RECORD_TYPE {
		return Err(failure(
			FailureKind::UnknownRecordType,
			format!("'{}' is not an extent batch", batch.type_name()),
		));
	}
	let count = batch.get_integer("count", 0)? as usize;
	let body = batch.data();
	if body.len() < 4 + count * EXTENT_SIZE {
		return Err(failure(FailureKind::OutOfRange, "extent batch shorter than its count"));
	}

	let mut prefix = EXTENT_RECORD_TYPE.as_bytes().to_vec();
	prefix.push(0);
	let mut extents = Vec::with_capacity(count);
	for index in 0..count {
		let at = 4 + index * EXTENT_SIZE;
		let mut bytes = prefix.clone();
		bytes.extend_from_slice(&body[at..at + EXTENT_SIZE]);
		extents.push(Record::from_bytes(&bytes)?);
	}
	Ok(extents)
}

/// Builds one ancillary-column batch record.
pub fn pack_ancillary(column: &str, element_size: usize, values: &[u8]) -> Result<Record> {
	register_pipeline_records();
	let count = if element_size == 0 { 0 } else { values.len() / element_size };
	let mut record = Record::with_data_size(ANCILLARY_RECORD_TYPE, 40 + values.len())?;
	record.set_text("column", column)?;
	record.set_integer("element_size", 0, element_size as i64)?;
	record.set_integer("count", 0, count as i64)?;
	record.data_mut()[40..40 + values.len()].copy_from_slice(values);
	Ok(record)
}

/// Wraps an extent batch and its ancillary batches into one container.
pub fn pack_batch_container(batch: &Record, ancillary: &[Record]) -> Result<Record> {
	let mut members: Vec<&Record> = Vec::with_capacity(1 + ancillary.len());
	members.push(batch);
	members.extend(ancillary.iter());
	pack_container(&members)
}

/// Builds one structured exception record.
pub fn pack_exception(kind: FailureKind, level: i32, text: &str) -> Result<Record> {
	register_pipeline_records();
	let mut record = Record::new(EXCEPTION_RECORD_TYPE)?;
	record.set_integer("code", 0, i64::from(kind.code()))?;
	record.set_integer("level", 0, i64::from(level))?;
	record.set_text("text", text)?;
	Ok(record)
}

/// Builds one sample-list record for `(extent, source)`. The zonal variant is
/// chosen automatically when any sample carries stats.
pub fn pack_samples(extent_id: ExtentId, key: &str, samples: &[RasterSample]) -> Result<Record> {
	register_pipeline_records();
	let zonal = samples.iter().any(|s| s.zonal.is_some());
	let entry_size = if zonal { ZONAL_ENTRY_SIZE } else { SAMPLE_ENTRY_SIZE };
	let record_type = if zonal { ZONAL_SAMPLE_RECORD_TYPE } else { SAMPLE_RECORD_TYPE };

	let mut record = Record::with_data_size(record_type, 32 + samples.len() * entry_size)?;
	record.set_integer("extent_id", 0, extent_id.0 as i64)?;
	record.set_text("key", key)?;
	record.set_integer("count", 0, samples.len() as i64)?;

	let body = record.data_mut();
	for (index, sample) in samples.iter().enumerate() {
		let at = 32 + index * entry_size;
		LittleEndian::write_f64(&mut body[at..at + 8], sample.value);
		LittleEndian::write_f64(&mut body[at + 8..at + 16], sample.time);
		LittleEndian::write_u64(&mut body[at + 16..at + 24], sample.file_id);
		LittleEndian::write_u32(&mut body[at + 24..at + 28], sample.flags);
		if zonal {
			let stats = sample.zonal.unwrap_or_default();
			LittleEndian::write_u32(&mut body[at + 28..at + 32], stats.count);
			LittleEndian::write_f64(&mut body[at + 32..at + 40], stats.min);
			LittleEndian::write_f64(&mut body[at + 40..at + 48], stats.max);
			LittleEndian::write_f64(&mut body[at + 48..at + 56], stats.mean);
			LittleEndian::write_f64(&mut body[at + 56..at + 64], stats.median);
			LittleEndian::write_f64(&mut body[at + 64..at + 72], stats.stdev);
			LittleEndian::write_f64(&mut body[at + 72..at + 80], stats.mad);
		}
	}
	Ok(record)
}

/// Reads the sample entries back out of a sample-list record.
pub fn unpack_samples(record: &Record) -> Result<Vec<RasterSample>> {
	let zonal = match record.type_name() {
		SAMPLE_RECORD_TYPE => false,
		ZONAL_SAMPLE_RECORD_TYPE => true,
		other => {
			return Err(failure(
				FailureKind::UnknownRecordType,
				format!("'{other}' is not a sample record"),
			));
		}
	};
	let entry_size = if zonal { ZONAL_ENTRY_SIZE } else { SAMPLE_ENTRY_SIZE };
	let count = record.get_integer("count", 0)? as usize;
	let body = record.data();
	if body.len() < 32 + count * entry_size {
		return Err(failure(FailureKind::OutOfRange, "sample record shorter than its count"));
	}

	let mut samples = Vec::with_capacity(count);
	for index in 0..count {
		let at = 32 + index * entry_size;
		let mut sample = RasterSample::new(
			LittleEndian::read_f64(&body[at..at + 8]),
			LittleEndian::read_f64(&body[at + 8..at + 16]),
		);
		sample.file_id = LittleEndian::read_u64(&body[at + 16..at + 24]);
		sample.flags = LittleEndian::read_u32(&body[at + 24..at + 28]);
		if zonal {
			sample.zonal = Some(ZonalStats {
				count: LittleEndian::read_u32(&body[at + 28..at + 32]),
				min: LittleEndian::read_f64(&body[at + 32..at + 40]),
				max: LittleEndian::read_f64(&body[at + 40..at + 48]),
				mean: LittleEndian::read_f64(&body[at + 48..at + 56]),
				median: LittleEndian::read_f64(&body[at + 56..at + 64]),
				stdev: LittleEndian::read_f64(&body[at + 64..at + 72]),
				mad: LittleEndian::read_f64(&body[at + 72..at + 80]),
			});
		}
		samples.push(sample);
	}
	Ok(samples)
}

/// Builds the trailing file-directory container mapping every assigned
/// `file_id` to its URL.
pub fn pack_file_directory(entries: &[(u64, String)]) -> Result<Record> {
	register_pipeline_records();
	let mut records = Vec::with_capacity(entries.len());
	for (file_id, url) in entries {
		let mut record = Record::with_data_size(FILE_DIRECTORY_RECORD_TYPE, 8 + url.len() + 1)?;
		record.set_integer("file_id", 0, *file_id as i64)?;
		record.set_text("file_name", url)?;
		records.push(record);
	}
	let refs: Vec<&Record> = records.iter().collect();
	pack_container(&refs).context("while packing the file directory")
}

/// Builds the end-of-request statistics record.
pub fn pack_stats(segments_read: u32, extents_filtered: u32, extents_sent: u32, pairs_complete: u32) -> Result<Record> {
	register_pipeline_records();
	let mut record = Record::new(STATS_RECORD_TYPE)?;
	record.set_integer("segments_read", 0, i64::from(segments_read))?;
	record.set_integer("extents_filtered", 0, i64::from(extents_filtered))?;
	record.set_integer("extents_sent", 0, i64::from(extents_sent))?;
	record.set_integer("pairs_complete", 0, i64::from(pairs_complete))?;
	Ok(record)
}

#[cfg(test)]
mod tests {
	use super::*;
	use beamline_core::record::split_container_bytes;
	use pretty_assertions::assert_eq;

	fn sample_extent(counter: u32) -> ExtentValues {
		ExtentValues {
			extent_id: ExtentId::pack(87, 3, 10, 1, 0, counter, 0),
			track: 1,
			pair: 0,
			spot: 1,
			quality: 0,
			segment_id: 1000 + counter,
			lat: -71.5,
			lon: 145.25,
			gps_time: 1_300_000_000.0,
			distance: 20.0 * f64::from(counter),
			height: 2450.75,
			photon_count: 120,
			spread: 38.5,
		}
	}

	#[test]
	fn extent_roundtrip() {
		let values = sample_extent(5);
		let record = pack_extent(&values).unwrap();
		assert_eq!(record.data().len(), EXTENT_SIZE);
		assert_eq!(record.get_integer("extent_id", 0).unwrap() as u64, values.extent_id.0);
		assert_eq!(record.get_integer("rgt", 0).unwrap(), 87);
		assert_eq!(record.get_real("lat", 0).unwrap(), -71.5);
		assert_eq!(record.get_integer("photon_count", 0).unwrap(), 120);
	}

	#[test]
	fn batch_is_exactly_count_times_extent_size() {
		let extents: Vec<Record> = (0..10).map(|i| pack_extent(&sample_extent(i)).unwrap()).collect();
		let batch = pack_extent_batch(&extents).unwrap();
		assert_eq!(batch.data().len(), 4 + 10 * EXTENT_SIZE);

		let back = unpack_extent_batch(&batch).unwrap();
		assert_eq!(back.len(), 10);
		for (index, extent) in back.iter().enumerate() {
			assert_eq!(extent.get_integer("segment_id", 0).unwrap(), 1000 + index as i64);
		}
	}

	#[test]
	fn empty_batch_roundtrip() {
		let batch = pack_extent_batch(&[]).unwrap();
		assert!(unpack_extent_batch(&batch).unwrap().is_empty());
	}

	#[test]
	fn ancillary_container_roundtrip() {
		let extents: Vec<Record> = (0..3).map(|i| pack_extent(&sample_extent(i)).unwrap()).collect();
		let batch = pack_extent_batch(&extents).unwrap();
		let values: Vec<u8> = [1.0f64, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect();
		let ancillary = pack_ancillary("dem_h", 8, &values).unwrap();

		let container = pack_batch_container(&batch, &[ancillary]).unwrap();
		let parts = split_container_bytes(&container.serialize()).unwrap();
		assert_eq!(parts.len(), 2);

		let first = Record::from_bytes(parts[0].as_slice()).unwrap();
		assert_eq!(first.type_name(), EXTENT_BATCH_RECORD_TYPE);
		let second = Record::from_bytes(parts[1].as_slice()).unwrap();
		assert_eq!(second.type_name(), ANCILLARY_RECORD_TYPE);
		assert_eq!(second.get_text("column").unwrap(), "dem_h");
		assert_eq!(second.get_integer("count", 0).unwrap(), 3);
	}

	#[test]
	fn exception_record_carries_kind_code() {
		let record = pack_exception(FailureKind::Timeout, 3, "join timed out on gt2l").unwrap();
		assert_eq!(record.get_integer("code", 0).unwrap(), i64::from(FailureKind::Timeout.code()));
		assert_eq!(record.get_text("text").unwrap(), "join timed out on gt2l");
	}

	#[test]
	fn sample_record_roundtrip() {
		let id = ExtentId::pack(87, 3, 10, 1, 0, 9, 0);
		let mut a = RasterSample::new(2450.5, 1000.0);
		a.file_id = 1;
		a.flags = 4;
		let mut b = RasterSample::new(2451.0, 1000.0);
		b.file_id = 2;

		let record = pack_samples(id, "mosaic", &[a.clone(), b.clone()]).unwrap();
		assert_eq!(record.type_name(), SAMPLE_RECORD_TYPE);
		assert_eq!(record.get_text("key").unwrap(), "mosaic");

		let back = unpack_samples(&record).unwrap();
		assert_eq!(back.len(), 2);
		assert_eq!(back[0], a);
		assert_eq!(back[1], b);
	}

	#[test]
	fn zonal_variant_is_chosen_when_stats_present() {
		let id = ExtentId::pack(87, 3, 10, 1, 0, 9, 0);
		let mut sample = RasterSample::new(10.0, 0.0);
		sample.zonal = Some(ZonalStats {
			count: 25,
			min: 1.0,
			max: 20.0,
			mean: 10.5,
			median: 10.0,
			stdev: 2.5,
			mad: 1.5,
		});
		let record = pack_samples(id, "dem", &[sample.clone()]).unwrap();
		assert_eq!(record.type_name(), ZONAL_SAMPLE_RECORD_TYPE);

		let back = unpack_samples(&record).unwrap();
		assert_eq!(back[0], sample);
	}

	#[test]
	fn file_directory_maps_every_id() {
		let container = pack_file_directory(&[(1, "s3://t/a.tif".to_string()), (2, "s3://t/b.tif".to_string())]).unwrap();
		let parts = split_container_bytes(&container.serialize()).unwrap();
		assert_eq!(parts.len(), 2);
		let entry = Record::from_bytes(parts[1].as_slice()).unwrap();
		assert_eq!(entry.get_integer("file_id", 0).unwrap(), 2);
		assert_eq!(entry.get_text("file_name").unwrap(), "s3://t/b.tif");
	}
}
