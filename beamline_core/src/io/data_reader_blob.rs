//! This module provides an in-memory data reader, used by tests and by
//! callers that already hold a granule as bytes.

use super::DataReaderTrait;
use crate::types::{Blob, ByteRange};
use anyhow::{Result, bail};
use async_trait::async_trait;

/// A reader over an in-memory byte buffer.
#[derive(Debug)]
pub struct DataReaderBlob {
	name: String,
	blob: Blob,
}

impl DataReaderBlob {
	#[must_use]
	pub fn new(name: &str, blob: Blob) -> Box<DataReaderBlob> {
		Box::new(DataReaderBlob {
			name: name.to_string(),
			blob,
		})
	}

	#[must_use]
	pub fn len(&self) -> u64 {
		self.blob.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.blob.is_empty()
	}
}

#[async_trait]
impl DataReaderTrait for DataReaderBlob {
	async fn read_range(&self, range: &ByteRange) -> Result<Blob> {
		if range.end() > self.blob.len() {
			bail!(
				"range {range:?} exceeds in-memory source '{}' of {} bytes",
				self.name,
				self.blob.len()
			);
		}
		self.blob.read_range(range)
	}

	async fn read_all(&self) -> Result<Blob> {
		Ok(self.blob.clone())
	}

	async fn get_size(&self) -> Result<u64> {
		Ok(self.blob.len())
	}

	fn get_name(&self) -> &str {
		&self.name
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::io::block_on;

	#[test]
	fn ranged_reads() {
		let reader = DataReaderBlob::new("mem", Blob::from(b"0123456789"));
		assert_eq!(reader.len(), 10);

		let blob = block_on(reader.read_range(&ByteRange::new(4, 3))).unwrap();
		assert_eq!(blob.as_slice(), b"456");
		assert!(block_on(reader.read_range(&ByteRange::new(8, 4))).is_err());

		let all = block_on(reader.read_all()).unwrap();
		assert_eq!(all.as_slice(), b"0123456789");
	}
}
