//! Group link storage: fractal heaps for dense version-2 groups, and the
//! symbol-table B-tree plus local heap of version-1 groups.

use super::format::{FHDB_SIGNATURE, FRHP_SIGNATURE, HEAP_SIGNATURE, SNOD_SIGNATURE, TREE_SIGNATURE};
use super::object_header::{HeaderVersion, HeaderWalker};
use beamline_core::failure::{FailureKind, failure};
use anyhow::{Context, Result};
use log::trace;

const FRHP_CHECKSUM_DIRECT_BLOCKS: u64 = 0x02;

impl HeaderWalker<'_> {
	/// Reads a fractal heap header and processes the link messages stored in
	/// its root direct block. Filtered heaps and indirect root blocks do not
	/// occur in the granules this pipeline reads.
	pub(crate) fn read_fractal_heap(&mut self, mut pos: u64, _version: HeaderVersion, dlvl: usize) -> Result<()> {
		let signature = self.file.read_field(4, &mut pos)? as u32;
		if signature != FRHP_SIGNATURE {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("bad fractal heap signature {signature:#010X}"),
			));
		}
		let version = self.file.read_field(1, &mut pos)?;
		if version != 0 {
			return Err(failure(FailureKind::UnsupportedFormat, format!("fractal heap version {version}")));
		}

		let _heap_obj_id_len = self.file.read_field(2, &mut pos)?;
		let io_filter_len = self.file.read_field(2, &mut pos)?;
		let flags = self.file.read_field(1, &mut pos)?;
		let _max_size_mg_obj = self.file.read_field(4, &mut pos)?;
		let _next_huge_obj_id = self.file.read_length(&mut pos)?;
		let _btree_addr_huge_obj = self.file.read_offset(&mut pos)?;
		let _free_space_mg_blks = self.file.read_length(&mut pos)?;
		let _addr_free_space_mg = self.file.read_offset(&mut pos)?;
		let _mg_space = self.file.read_length(&mut pos)?;
		let _alloc_mg_space = self.file.read_length(&mut pos)?;
		let _dblk_alloc_iter = self.file.read_length(&mut pos)?;
		let mg_objs = self.file.read_length(&mut pos)?;
		let _huge_obj_size = self.file.read_length(&mut pos)?;
		let _huge_objs = self.file.read_length(&mut pos)?;
		let _tiny_obj_size = self.file.read_length(&mut pos)?;
		let _tiny_objs = self.file.read_length(&mut pos)?;
		let _table_width = self.file.read_field(2, &mut pos)?;
		let starting_blk_size = self.file.read_length(&mut pos)?;
		let _max_dblk_size = self.file.read_length(&mut pos)?;
		let max_heap_size = self.file.read_field(2, &mut pos)?;
		let _start_num_rows = self.file.read_field(2, &mut pos)?;
		let root_blk_addr = self.file.read_offset(&mut pos)?;
		let curr_num_rows = self.file.read_field(2, &mut pos)?;

		if io_filter_len > 0 {
			return Err(failure(FailureKind::UnsupportedFormat, "filtered fractal heaps are not supported"));
		}
		if curr_num_rows != 0 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				"fractal heaps with indirect root blocks are not supported",
			));
		}

		let block_offset_size = max_heap_size.div_ceil(8);
		let checksum_present = flags & FRHP_CHECKSUM_DIRECT_BLOCKS != 0;
		self
			.read_direct_block(
				root_blk_addr,
				block_offset_size as usize,
				checksum_present,
				starting_blk_size,
				mg_objs,
				dlvl,
			)
			.context("while reading the heap's root direct block")
	}

	fn read_direct_block(
		&mut self,
		mut pos: u64,
		block_offset_size: usize,
		checksum_present: bool,
		block_size: u64,
		messages_in_block: u64,
		dlvl: usize,
	) -> Result<()> {
		let start = pos;
		let signature = self.file.read_field(4, &mut pos)? as u32;
		if signature != FHDB_SIGNATURE {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("bad direct block signature {signature:#010X}"),
			));
		}
		let version = self.file.read_field(1, &mut pos)?;
		if version != 0 {
			return Err(failure(FailureKind::UnsupportedFormat, format!("direct block version {version}")));
		}
		let _heap_header_address = self.file.read_offset(&mut pos)?;
		pos += block_offset_size as u64;
		if checksum_present {
			pos += 4;
		}

		let end = start + block_size;
		for _ in 0..messages_in_block {
			if pos >= end {
				break;
			}
			let consumed = self.read_link_msg(pos, dlvl)?;
			pos += consumed;
		}
		Ok(())
	}

	/// A version-1 group: symbol-table message pointing at a name B-tree and a
	/// local heap holding the link names.
	pub(crate) fn read_symbol_table_msg(&mut self, mut pos: u64, dlvl: usize) -> Result<()> {
		let btree_address = self.file.read_offset(&mut pos)?;
		let heap_address = self.file.read_offset(&mut pos)?;
		let heap_data_address = self.read_local_heap(heap_address)?;
		self
			.read_group_btree(btree_address, heap_data_address, dlvl)
			.context("while walking a group B-tree")
	}

	/// Parses a local heap header, returning the address of its data segment.
	fn read_local_heap(&mut self, mut pos: u64) -> Result<u64> {
		let signature = self.file.read_field(4, &mut pos)? as u32;
		if signature != HEAP_SIGNATURE {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("bad local heap signature {signature:#010X}"),
			));
		}
		let version = self.file.read_field(1, &mut pos)?;
		if version != 0 {
			return Err(failure(FailureKind::UnsupportedFormat, format!("local heap version {version}")));
		}
		pos += 3; // reserved
		let _data_segment_size = self.file.read_length(&mut pos)?;
		let _free_list_head = self.file.read_length(&mut pos)?;
		self.file.read_offset(&mut pos)
	}

	fn read_group_btree(&mut self, mut pos: u64, heap_data_address: u64, dlvl: usize) -> Result<()> {
		let signature = self.file.read_field(4, &mut pos)? as u32;
		if signature != TREE_SIGNATURE {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("bad B-tree signature {signature:#010X}"),
			));
		}
		let node_type = self.file.read_field(1, &mut pos)?;
		if node_type != 0 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("group B-tree node type {node_type}"),
			));
		}
		let node_level = self.file.read_field(1, &mut pos)?;
		let entries_used = self.file.read_field(2, &mut pos)?;
		let _left_sibling = self.file.read_offset(&mut pos)?;
		let _right_sibling = self.file.read_offset(&mut pos)?;

		let mut children = Vec::with_capacity(entries_used as usize);
		let _key0 = self.file.read_length(&mut pos)?;
		for _ in 0..entries_used {
			children.push(self.file.read_offset(&mut pos)?);
			let _key = self.file.read_length(&mut pos)?;
		}

		for child in children {
			if self.is_done() {
				break;
			}
			if node_level > 0 {
				self.read_group_btree(child, heap_data_address, dlvl)?;
			} else {
				self.read_symbol_table_node(child, heap_data_address, dlvl)?;
			}
		}
		Ok(())
	}

	fn read_symbol_table_node(&mut self, mut pos: u64, heap_data_address: u64, dlvl: usize) -> Result<()> {
		let signature = self.file.read_field(4, &mut pos)? as u32;
		if signature != SNOD_SIGNATURE {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("bad symbol table signature {signature:#010X}"),
			));
		}
		let version = self.file.read_field(1, &mut pos)?;
		if version != 1 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("symbol table version {version}"),
			));
		}
		pos += 1; // reserved
		let num_symbols = self.file.read_field(2, &mut pos)?;

		for _ in 0..num_symbols {
			if self.is_done() {
				break;
			}
			let name_offset = self.file.read_offset(&mut pos)?;
			let header_address = self.file.read_offset(&mut pos)?;
			pos += 4 + 4 + 16; // cache type, reserved, scratch pad

			let name = self.read_heap_string(heap_data_address + name_offset)?;
			trace!("symbol '{name}' -> {header_address:#X} at level {dlvl}");
			if dlvl < self.path.len() && name == self.path[dlvl] {
				self.read_object_header(header_address, dlvl + 1)?;
			}
		}
		Ok(())
	}

	/// Reads a NUL-terminated name from the local heap data segment.
	fn read_heap_string(&self, pos: u64) -> Result<String> {
		const STEP: u64 = 64;
		const LONGEST_NAME: usize = 512;

		let source_size = self.file.cache.source_size();
		let mut at = pos;
		let mut name = Vec::new();
		loop {
			let step = STEP.min(source_size.saturating_sub(at));
			if step == 0 {
				return Err(failure(FailureKind::UnsupportedFormat, "link name runs past the end of the file"));
			}
			let chunk = self.file.read_bytes(step as usize, &mut at)?;
			if let Some(nul) = chunk.iter().position(|&b| b == 0) {
				name.extend_from_slice(&chunk[..nul]);
				break;
			}
			name.extend_from_slice(&chunk);
			if name.len() > LONGEST_NAME {
				return Err(failure(FailureKind::UnsupportedFormat, "unterminated link name in local heap"));
			}
		}
		Ok(String::from_utf8_lossy(&name).into_owned())
	}
}
