//! The field cursor over one open archive: every parse reads little-endian
//! fields at an explicit position, through the block cache.

use super::block_cache::{BlockCache, L1_LINE_SIZE};
use super::format::is_undefined_address;
use super::superblock::Superblock;
use beamline_core::io::DataReader;
use beamline_core::types::ByteRange;
use anyhow::{Result, bail};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

/// One open archive: the ranged reader, its cache, and the superblock sizes
/// every field read depends on.
pub(crate) struct ArchiveFile {
	pub reader: DataReader,
	pub cache: Arc<BlockCache>,
	pub superblock: Superblock,
}

impl ArchiveFile {
	/// Reads an unsigned little-endian field of 1..=8 bytes at `*pos`,
	/// advancing the position.
	pub fn read_field(&self, size: usize, pos: &mut u64) -> Result<u64> {
		if size == 0 || size > 8 {
			bail!("invalid field size {size}");
		}
		let bytes = self.cache.read(&self.reader, &ByteRange::new(*pos, size as u64), L1_LINE_SIZE)?;
		*pos += size as u64;
		Ok(LittleEndian::read_uint(&bytes, size))
	}

	/// Reads an address field of the superblock's offset size.
	pub fn read_offset(&self, pos: &mut u64) -> Result<u64> {
		self.read_field(self.superblock.offset_size, pos)
	}

	/// Reads a length field of the superblock's length size.
	pub fn read_length(&self, pos: &mut u64) -> Result<u64> {
		self.read_field(self.superblock.length_size, pos)
	}

	/// Reads `len` raw bytes at `*pos`, advancing the position.
	pub fn read_bytes(&self, len: usize, pos: &mut u64) -> Result<Vec<u8>> {
		let bytes = self.cache.read(&self.reader, &ByteRange::new(*pos, len as u64), L1_LINE_SIZE)?;
		*pos += len as u64;
		Ok(bytes)
	}

	/// Bulk read with an explicit traffic hint, for data chunks.
	pub fn read_bulk(&self, range: &ByteRange, hint: u64) -> Result<Vec<u8>> {
		self.cache.read(&self.reader, range, hint)
	}

	/// Whether an address field read via [`read_offset`] is "undefined".
	pub fn is_undefined(&self, address: u64) -> bool {
		is_undefined_address(address, self.superblock.offset_size)
	}

	pub fn name(&self) -> &str {
		self.reader.get_name()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use beamline_core::io::DataReaderBlob;
	use beamline_core::types::Blob;

	fn file_over(bytes: &[u8]) -> ArchiveFile {
		let reader: DataReader = DataReaderBlob::new("mem", Blob::from(bytes));
		let cache = Arc::new(BlockCache::new(bytes.len() as u64));
		ArchiveFile {
			reader,
			cache,
			superblock: Superblock {
				offset_size: 8,
				length_size: 8,
				root_group_address: 0,
			},
		}
	}

	#[test]
	fn fields_are_little_endian() {
		let file = file_over(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
		let mut pos = 0;
		assert_eq!(file.read_field(2, &mut pos).unwrap(), 0x0201);
		assert_eq!(file.read_field(4, &mut pos).unwrap(), 0x0605_0403);
		assert_eq!(pos, 6);
	}

	#[test]
	fn invalid_field_sizes_are_rejected() {
		let file = file_over(&[0; 16]);
		let mut pos = 0;
		assert!(file.read_field(0, &mut pos).is_err());
		assert!(file.read_field(9, &mut pos).is_err());
	}

	#[test]
	fn undefined_address_uses_offset_size() {
		let mut file = file_over(&[0; 16]);
		assert!(file.is_undefined(u64::MAX));
		assert!(!file.is_undefined(0));
		file.superblock.offset_size = 4;
		assert!(file.is_undefined(0xFFFF_FFFF));
	}
}
