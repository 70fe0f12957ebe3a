//! The two-level block cache between the archive parser and object storage.
//!
//! Both levels hold aligned lines keyed by line offset: L1 lines of 1 MiB for
//! hot small reads (headers, tree nodes), L2 lines of 128 MiB for bulk data
//! chunks. A small read that misses L1 is filled from a covering L2 line when
//! one exists; otherwise the line is fetched from storage into the level the
//! caller's size hint prefers. No lock is held across a fetch; the lock is
//! retaken only to install the new line.

use beamline_core::io::{DataReader, block_on};
use beamline_core::types::ByteRange;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{Context, Result};

/// L1 line size: 1 MiB.
pub const L1_LINE_SIZE: u64 = 0x10_0000;
/// L1 lines kept per context.
pub const L1_ENTRIES: usize = 157;
/// L2 line size: 128 MiB.
pub const L2_LINE_SIZE: u64 = 0x800_0000;
/// L2 lines kept per context.
pub const L2_ENTRIES: usize = 17;

struct Lines {
	l1: LruCache<u64, Arc<Vec<u8>>>,
	l2: LruCache<u64, Arc<Vec<u8>>>,
}

/// A per-context two-level cache over one ranged reader.
pub struct BlockCache {
	lines: Mutex<Lines>,
	source_size: u64,
}

impl BlockCache {
	#[must_use]
	pub fn new(source_size: u64) -> Self {
		Self {
			lines: Mutex::new(Lines {
				l1: LruCache::new(NonZeroUsize::new(L1_ENTRIES).unwrap()),
				l2: LruCache::new(NonZeroUsize::new(L2_ENTRIES).unwrap()),
			}),
			source_size,
		}
	}

	/// Size of the backing source in bytes.
	#[must_use]
	pub fn source_size(&self) -> u64 {
		self.source_size
	}

	/// Number of lines currently resident, `(l1, l2)`.
	#[must_use]
	pub fn line_counts(&self) -> (usize, usize) {
		let lines = self.lines.lock();
		(lines.l1.len(), lines.l2.len())
	}

	fn line_range(&self, line_offset: u64, line_size: u64) -> ByteRange {
		let length = line_size.min(self.source_size.saturating_sub(line_offset));
		ByteRange::new(line_offset, length)
	}

	/// Fetches one aligned line from storage, retrying once: a transient read
	/// timeout is absorbed here rather than surfaced to the parser.
	fn fetch(&self, reader: &DataReader, range: &ByteRange) -> Result<Arc<Vec<u8>>> {
		let first = block_on(reader.read_range(range));
		let blob = match first {
			Ok(blob) => blob,
			Err(error) => {
				log::warn!("retrying block fetch {range:?} of '{}' after: {error:#}", reader.get_name());
				block_on(reader.read_range(range))
					.with_context(|| format!("while fetching block {range:?} of '{}'", reader.get_name()))?
			}
		};
		Ok(Arc::new(blob.into_vec()))
	}

	fn l1_line(&self, reader: &DataReader, line_offset: u64, hint: u64) -> Result<Arc<Vec<u8>>> {
		if let Some(line) = self.lines.lock().l1.get(&line_offset) {
			return Ok(line.clone());
		}

		// A covering L2 line fills L1 without touching storage.
		let l2_offset = line_offset - (line_offset % L2_LINE_SIZE);
		let from_l2 = self.lines.lock().l2.get(&l2_offset).cloned();
		let line = if let Some(l2) = from_l2 {
			let start = (line_offset - l2_offset) as usize;
			let end = (start + L1_LINE_SIZE as usize).min(l2.len());
			Arc::new(l2[start..end].to_vec())
		} else if hint > L1_LINE_SIZE {
			// The caller expects bulk traffic nearby: fetch the whole L2 line
			// and carve the L1 line out of it.
			let l2 = self.fetch(reader, &self.line_range(l2_offset, L2_LINE_SIZE))?;
			let start = (line_offset - l2_offset) as usize;
			let end = (start + L1_LINE_SIZE as usize).min(l2.len());
			let carved = Arc::new(l2[start..end].to_vec());
			self.lines.lock().l2.put(l2_offset, l2);
			carved
		} else {
			self.fetch(reader, &self.line_range(line_offset, L1_LINE_SIZE))?
		};

		self.lines.lock().l1.put(line_offset, line.clone());
		Ok(line)
	}

	fn l2_line(&self, reader: &DataReader, line_offset: u64) -> Result<Arc<Vec<u8>>> {
		if let Some(line) = self.lines.lock().l2.get(&line_offset) {
			return Ok(line.clone());
		}
		let line = self.fetch(reader, &self.line_range(line_offset, L2_LINE_SIZE))?;
		self.lines.lock().l2.put(line_offset, line.clone());
		Ok(line)
	}

	/// Reads `range` through the cache. `hint` is the caller's expectation of
	/// upcoming traffic around this offset and decides which level a miss is
	/// fetched into.
	pub fn read(&self, reader: &DataReader, range: &ByteRange, hint: u64) -> Result<Vec<u8>> {
		if range.end() > self.source_size {
			anyhow::bail!(
				"read {range:?} past the end of '{}' ({} bytes)",
				reader.get_name(),
				self.source_size
			);
		}

		let bulk = range.length > L1_LINE_SIZE;
		let line_size = if bulk { L2_LINE_SIZE } else { L1_LINE_SIZE };

		let mut out = Vec::with_capacity(range.length as usize);
		let mut at = range.offset;
		while at < range.end() {
			let line_offset = at - (at % line_size);
			let line = if bulk {
				self.l2_line(reader, line_offset)?
			} else {
				self.l1_line(reader, line_offset, hint)?
			};
			let start = (at - line_offset) as usize;
			let take = ((range.end() - at) as usize).min(line.len() - start);
			out.extend_from_slice(&line[start..start + take]);
			at += take as u64;
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use beamline_core::io::DataReaderBlob;
	use beamline_core::types::Blob;

	fn source(len: usize) -> (DataReader, u64) {
		let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
		(DataReaderBlob::new("mem", Blob::from(data)), len as u64)
	}

	#[test]
	fn small_read_is_served_and_cached() {
		let (reader, size) = source(4096);
		let cache = BlockCache::new(size);

		let bytes = cache.read(&reader, &ByteRange::new(100, 16), L1_LINE_SIZE).unwrap();
		assert_eq!(bytes.len(), 16);
		assert_eq!(bytes[0], (100 % 251) as u8);
		assert_eq!(cache.line_counts(), (1, 0));

		// second read of the same region hits the resident line
		let again = cache.read(&reader, &ByteRange::new(101, 8), L1_LINE_SIZE).unwrap();
		assert_eq!(again[0], (101 % 251) as u8);
		assert_eq!(cache.line_counts(), (1, 0));
	}

	#[test]
	fn line_is_clamped_at_end_of_source() {
		let (reader, size) = source(1000);
		let cache = BlockCache::new(size);
		let bytes = cache.read(&reader, &ByteRange::new(990, 10), L1_LINE_SIZE).unwrap();
		assert_eq!(bytes.len(), 10);
		assert!(cache.read(&reader, &ByteRange::new(995, 10), L1_LINE_SIZE).is_err());
	}

	#[test]
	fn read_spanning_two_l1_lines() {
		let (reader, size) = source(3 * L1_LINE_SIZE as usize);
		let cache = BlockCache::new(size);
		let at = L1_LINE_SIZE - 8;
		let bytes = cache.read(&reader, &ByteRange::new(at, 16), L1_LINE_SIZE).unwrap();
		assert_eq!(bytes.len(), 16);
		for (i, byte) in bytes.iter().enumerate() {
			assert_eq!(*byte, ((at as usize + i) % 251) as u8);
		}
		assert_eq!(cache.line_counts(), (2, 0));
	}

	#[test]
	fn bulk_hint_fills_l2_and_l1_reads_reuse_it() {
		let (reader, size) = source(2 * L1_LINE_SIZE as usize);
		let cache = BlockCache::new(size);

		// small read with a bulk hint lands the L2 line as well
		let bytes = cache.read(&reader, &ByteRange::new(64, 32), 8 * L1_LINE_SIZE).unwrap();
		assert_eq!(bytes.len(), 32);
		assert_eq!(cache.line_counts(), (1, 1));

		// a later small read in the second L1 line is carved from L2
		let bytes = cache
			.read(&reader, &ByteRange::new(L1_LINE_SIZE + 5, 5), L1_LINE_SIZE)
			.unwrap();
		assert_eq!(bytes[0], ((L1_LINE_SIZE as usize + 5) % 251) as u8);
		assert_eq!(cache.line_counts(), (2, 1));
	}

	#[test]
	fn bulk_read_goes_through_l2() {
		let (reader, size) = source(3 * L1_LINE_SIZE as usize);
		let cache = BlockCache::new(size);
		let bytes = cache
			.read(&reader, &ByteRange::new(10, 2 * L1_LINE_SIZE), L2_LINE_SIZE)
			.unwrap();
		assert_eq!(bytes.len(), 2 * L1_LINE_SIZE as usize);
		let (l1, l2) = cache.line_counts();
		assert_eq!(l1, 0);
		assert_eq!(l2, 1);
	}

	#[test]
	fn lru_eviction_keeps_line_count_bounded() {
		let len = (L1_ENTRIES + 8) * L1_LINE_SIZE as usize;
		let (reader, size) = source(len);
		let cache = BlockCache::new(size);
		for i in 0..(L1_ENTRIES + 8) {
			cache
				.read(&reader, &ByteRange::new(i as u64 * L1_LINE_SIZE, 8), L1_LINE_SIZE)
				.unwrap();
		}
		let (l1, _) = cache.line_counts();
		assert_eq!(l1, L1_ENTRIES);
	}
}
