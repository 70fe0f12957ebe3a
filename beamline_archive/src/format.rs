//! On-disk constants of the archive format. All multi-byte fields are
//! little-endian on disk; signatures below are the little-endian readings of
//! their ASCII byte sequences.

/// File signature: `89 48 44 46 0D 0A 1A 0A`.
pub const FILE_SIGNATURE: u64 = 0x0A1A_0A0D_4644_4889;

/// Version-2 object header chunk, `OHDR`.
pub const OHDR_SIGNATURE: u32 = 0x5244_484F;
/// Fractal heap header, `FRHP`.
pub const FRHP_SIGNATURE: u32 = 0x5048_5246;
/// Fractal heap direct block, `FHDB`.
pub const FHDB_SIGNATURE: u32 = 0x4244_4846;
/// Object header continuation chunk, `OCHK`.
pub const OCHK_SIGNATURE: u32 = 0x4B48_434F;
/// B-tree version 1 node, `TREE`.
pub const TREE_SIGNATURE: u32 = 0x4545_5254;
/// Local heap, `HEAP`.
pub const HEAP_SIGNATURE: u32 = 0x5041_4548;
/// Symbol table node, `SNOD`.
pub const SNOD_SIGNATURE: u32 = 0x444F_4E53;

/// An address field of all ones marks "undefined".
#[must_use]
pub fn is_undefined_address(address: u64, offset_size: usize) -> bool {
	if offset_size >= 8 {
		address == u64::MAX
	} else {
		address == (1u64 << (offset_size * 8)) - 1
	}
}

/// Header message types the reader interprets; everything else is skipped by
/// its declared length.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageType {
	Nil,
	Dataspace,
	LinkInfo,
	Datatype,
	FillValue,
	Link,
	DataLayout,
	FilterPipeline,
	HeaderContinuation,
	SymbolTable,
	Other(u16),
}

impl From<u16> for MessageType {
	fn from(value: u16) -> Self {
		match value {
			0x00 => MessageType::Nil,
			0x01 => MessageType::Dataspace,
			0x02 => MessageType::LinkInfo,
			0x03 => MessageType::Datatype,
			0x05 => MessageType::FillValue,
			0x06 => MessageType::Link,
			0x08 => MessageType::DataLayout,
			0x0B => MessageType::FilterPipeline,
			0x10 => MessageType::HeaderContinuation,
			0x11 => MessageType::SymbolTable,
			other => MessageType::Other(other),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn signatures_match_their_ascii_bytes() {
		assert_eq!(&OHDR_SIGNATURE.to_le_bytes(), b"OHDR");
		assert_eq!(&FRHP_SIGNATURE.to_le_bytes(), b"FRHP");
		assert_eq!(&FHDB_SIGNATURE.to_le_bytes(), b"FHDB");
		assert_eq!(&OCHK_SIGNATURE.to_le_bytes(), b"OCHK");
		assert_eq!(&TREE_SIGNATURE.to_le_bytes(), b"TREE");
		assert_eq!(&HEAP_SIGNATURE.to_le_bytes(), b"HEAP");
		assert_eq!(&SNOD_SIGNATURE.to_le_bytes(), b"SNOD");
	}

	#[test]
	fn file_signature_bytes() {
		assert_eq!(
			&FILE_SIGNATURE.to_le_bytes(),
			&[0x89, 0x48, 0x44, 0x46, 0x0D, 0x0A, 0x1A, 0x0A]
		);
	}

	#[test]
	fn undefined_addresses_by_width() {
		assert!(is_undefined_address(0xFFFF_FFFF, 4));
		assert!(!is_undefined_address(0xFFFF_FFFF, 8));
		assert!(is_undefined_address(u64::MAX, 8));
	}

	#[test]
	fn message_type_mapping() {
		assert_eq!(MessageType::from(0x01), MessageType::Dataspace);
		assert_eq!(MessageType::from(0x08), MessageType::DataLayout);
		assert_eq!(MessageType::from(0x2A), MessageType::Other(0x2A));
	}
}
