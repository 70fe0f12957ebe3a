//! Superblock parsing: the fixed header every archive starts with.
//!
//! Only version-0 superblocks are supported; they are what the altimetry
//! granules this pipeline reads carry. The superblock fixes the width of every
//! address and length field in the rest of the file.

use super::file::ArchiveFile;
use super::format::FILE_SIGNATURE;
use beamline_core::failure::{FailureKind, failure};
use anyhow::{Context, Result};

/// Parsed superblock: field widths and the root group's header address.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Superblock {
	pub offset_size: usize,
	pub length_size: usize,
	pub root_group_address: u64,
}

impl Default for Superblock {
	fn default() -> Self {
		Self {
			offset_size: 8,
			length_size: 8,
			root_group_address: 0,
		}
	}
}

impl Superblock {
	/// Reads and verifies the superblock of `file`.
	pub fn read(file: &ArchiveFile) -> Result<Superblock> {
		let mut pos = 0u64;

		let signature = file.read_field(8, &mut pos).context("while reading the file signature")?;
		if signature != FILE_SIGNATURE {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("bad file signature {signature:#018X} in '{}'", file.name()),
			));
		}

		let superblock_version = file.read_field(1, &mut pos)?;
		if superblock_version != 0 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("unsupported superblock version {superblock_version}"),
			));
		}
		let freespace_version = file.read_field(1, &mut pos)?;
		let roottable_version = file.read_field(1, &mut pos)?;
		pos += 1; // reserved
		let headermsg_version = file.read_field(1, &mut pos)?;
		if freespace_version != 0 || roottable_version != 0 || headermsg_version != 0 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				"unsupported free-space, root-table or header-message version",
			));
		}

		let offset_size = file.read_field(1, &mut pos)? as usize;
		let length_size = file.read_field(1, &mut pos)? as usize;
		if !(1..=8).contains(&offset_size) || !(1..=8).contains(&length_size) {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("implausible field widths: offsets {offset_size}, lengths {length_size}"),
			));
		}

		// leaf K (2), internal K (2), consistency flags (4), then the base,
		// free-space, end-of-file and driver-info addresses
		pos = 24 + 4 * offset_size as u64;
		// root group symbol table entry: link name offset, then the header address
		pos += offset_size as u64;
		let root_group_address = file.read_field(offset_size, &mut pos)?;

		Ok(Superblock {
			offset_size,
			length_size,
			root_group_address,
		})
	}
}
