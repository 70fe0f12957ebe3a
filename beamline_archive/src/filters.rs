//! The chunk filter pipeline: deflate, byte shuffle and Fletcher32.
//!
//! Filters are declared in write order; a read applies the inverses in
//! reverse order, so a `[shuffle, deflate, fletcher32]` pipeline is undone as
//! verify-checksum, inflate, unshuffle.

use super::metadata::{Filter, FilterKind};
use beamline_core::failure::{FailureKind, failure};
use anyhow::{Context, Result};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Inflates one deflate-compressed chunk.
pub fn inflate(input: &[u8]) -> Result<Vec<u8>> {
	let mut output = Vec::new();
	ZlibDecoder::new(input)
		.read_to_end(&mut output)
		.map_err(|e| failure(FailureKind::FilterError, format!("inflate failed: {e}")))?;
	Ok(output)
}

/// Undoes the byte shuffle: the stream holds every element's byte 0, then
/// every byte 1, and so on. Trailing bytes that do not fill an element are
/// passed through unshuffled, matching the writer.
#[must_use]
pub fn unshuffle(input: &[u8], element_size: usize) -> Vec<u8> {
	if element_size <= 1 || input.len() < element_size {
		return input.to_vec();
	}
	let count = input.len() / element_size;
	let body = count * element_size;
	let mut output = vec![0u8; input.len()];
	for byte_index in 0..element_size {
		for element in 0..count {
			output[element * element_size + byte_index] = input[byte_index * count + element];
		}
	}
	output[body..].copy_from_slice(&input[body..]);
	output
}

/// Fletcher32 over the data as big-endian 16-bit words, the way the archive
/// format computes it.
#[must_use]
pub fn fletcher32(data: &[u8]) -> u32 {
	let mut sum1: u32 = 0;
	let mut sum2: u32 = 0;
	let mut words = data.len() / 2;
	let mut at = 0;

	while words > 0 {
		let block = words.min(360);
		words -= block;
		for _ in 0..block {
			sum1 += (u32::from(data[at]) << 8) | u32::from(data[at + 1]);
			sum2 += sum1;
			at += 2;
		}
		sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
		sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
	}

	if data.len() % 2 == 1 {
		sum1 += u32::from(data[at]) << 8;
		sum2 += sum1;
		sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
		sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);
	}

	// second fold handles the carry the first one can produce
	sum1 = (sum1 & 0xFFFF) + (sum1 >> 16);
	sum2 = (sum2 & 0xFFFF) + (sum2 >> 16);

	(sum2 << 16) | sum1
}

/// Verifies and strips the trailing Fletcher32 word of a chunk.
pub fn verify_fletcher32(chunk: &[u8]) -> Result<&[u8]> {
	if chunk.len() < 4 {
		return Err(failure(FailureKind::ChecksumMismatch, "chunk too short for a checksum"));
	}
	let (body, trailer) = chunk.split_at(chunk.len() - 4);
	let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
	let computed = fletcher32(body);
	if stored != computed {
		return Err(failure(
			FailureKind::ChecksumMismatch,
			format!("stored {stored:#010X}, computed {computed:#010X}"),
		));
	}
	Ok(body)
}

/// Decodes one raw chunk through `filters`, reversed. `filter_mask` bits mark
/// pipeline stages the writer skipped for this particular chunk.
pub fn decode_chunk(raw: Vec<u8>, filters: &[Filter], filter_mask: u32, element_size: usize) -> Result<Vec<u8>> {
	let mut data = raw;
	for (index, filter) in filters.iter().enumerate().rev() {
		if filter_mask & (1 << index) != 0 {
			continue;
		}
		data = match filter.kind {
			FilterKind::Fletcher32 => verify_fletcher32(&data).context("while verifying a chunk checksum")?.to_vec(),
			FilterKind::Deflate => inflate(&data).context("while inflating a chunk")?,
			FilterKind::Shuffle => unshuffle(&data, element_size),
			FilterKind::Unsupported(id) => {
				return Err(failure(FailureKind::UnsupportedFilter, format!("filter id {id} is not supported")));
			}
		};
	}
	Ok(data)
}
