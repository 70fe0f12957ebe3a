//! Container records: N heterogeneous records concatenated under one outer
//! envelope. Each sub-record is length-prefixed so a consumer can split the
//! container without knowing any inner schema.

use super::definition::define_record;
use super::field::{FLAG_NATIVE, FieldDef, FieldType};
use super::record::Record;
use crate::failure::{FailureKind, failure};
use crate::types::Blob;
use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Once;

/// Type name of the container envelope.
pub const CONTAINER_RECORD_TYPE: &str = "conrec";

static REGISTER: Once = Once::new();

/// Registers the container definition. Called lazily by [`pack_container`];
/// callers that deserialize containers first should call it at startup.
pub fn register_container_record() {
	REGISTER.call_once(|| {
		let fields = vec![FieldDef::new("REC_COUNT", FieldType::UInt32, 0, 1, FLAG_NATIVE)];
		define_record(CONTAINER_RECORD_TYPE, None, 4, &fields).expect("container record definition");
	});
}

/// Packs serialized records into one container envelope.
pub fn pack_container(records: &[&Record]) -> Result<Record> {
	register_container_record();

	let payload: usize = records.iter().map(|r| 4 + r.len()).sum();
	let mut container = Record::with_data_size(CONTAINER_RECORD_TYPE, 4 + payload)?;
	container.set_integer("REC_COUNT", 0, records.len() as i64)?;

	let body = container.data_mut();
	let mut at = 4;
	for record in records {
		let bytes = record.as_bytes();
		LittleEndian::write_u32(&mut body[at..at + 4], bytes.len() as u32);
		body[at + 4..at + 4 + bytes.len()].copy_from_slice(bytes);
		at += 4 + bytes.len();
	}
	Ok(container)
}

/// Splits a container body into its sub-record byte blobs. Only the length
/// prefixes are interpreted; inner schemas stay opaque.
pub fn unpack_container(container: &Record) -> Result<Vec<Blob>> {
	if container.type_name() != CONTAINER_RECORD_TYPE {
		return Err(failure(
			FailureKind::UnknownRecordType,
			format!("'{}' is not a container record", container.type_name()),
		));
	}
	let body = container.data();
	let count = container.get_integer("REC_COUNT", 0)? as usize;

	let mut records = Vec::with_capacity(count);
	let mut at = 4;
	for index in 0..count {
		if at + 4 > body.len() {
			return Err(failure(
				FailureKind::OutOfRange,
				format!("container truncated before sub-record {index}"),
			));
		}
		let length = LittleEndian::read_u32(&body[at..at + 4]) as usize;
		at += 4;
		if at + length > body.len() {
			return Err(failure(
				FailureKind::OutOfRange,
				format!("sub-record {index} of {length} bytes exceeds the container"),
			));
		}
		records.push(Blob::from(&body[at..at + length]));
		at += length;
	}
	Ok(records)
}

/// Deserializes a container from wire bytes and splits it.
pub fn split_container_bytes(bytes: &[u8]) -> Result<Vec<Blob>> {
	register_container_record();
	let container = Record::from_bytes(bytes).context("while parsing the container envelope")?;
	unpack_container(&container)
}
