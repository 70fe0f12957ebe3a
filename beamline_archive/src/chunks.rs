//! Slab reads: assembling a requested row range from compact, contiguous or
//! chunked storage, decoding each chunk through its filter pipeline.

use super::datatype::{ElementType, normalize_endianness};
use super::file::ArchiveFile;
use super::filters::decode_chunk;
use super::format::TREE_SIGNATURE;
use super::metadata::{DatasetMeta, Layout};
use beamline_core::failure::{FailureKind, failure};
use beamline_core::types::ByteRange;
use anyhow::{Context, Result};
use log::trace;

/// Row selection covering everything from `first_row` to the end.
pub const ALL_ROWS: i64 = -1;

struct ChunkKey {
	chunk_size: u32,
	filter_mask: u32,
	start: [u64; 2],
}

/// Reads `num_rows` rows starting at `first_row` of column `col`.
pub(crate) fn read_slab(
	file: &ArchiveFile,
	meta: &DatasetMeta,
	col: u64,
	first_row: u64,
	num_rows: i64,
) -> Result<super::array_data::ArrayData> {
	meta.check_filters()?;

	let total_rows = meta.dataspace.num_rows();
	let total_cols = meta.dataspace.num_cols();
	if col >= total_cols {
		return Err(failure(
			FailureKind::OutOfRange,
			format!("column {col} of {total_cols} available"),
		));
	}

	let first_row = first_row.min(total_rows);
	let rows = if num_rows == ALL_ROWS {
		total_rows - first_row
	} else {
		(num_rows.max(0) as u64).min(total_rows - first_row)
	};

	let element_size = meta.datatype.size;
	let row_bytes = total_cols * element_size as u64;
	let mut buffer = vec![0u8; (rows * row_bytes) as usize];

	match &meta.layout {
		Layout::Compact(data) => {
			let start = (first_row * row_bytes) as usize;
			let end = start + buffer.len();
			if end > data.len() {
				return Err(failure(FailureKind::OutOfRange, "compact data shorter than the dataspace"));
			}
			buffer.copy_from_slice(&data[start..end]);
		}
		Layout::Contiguous { address, size } => {
			let offset = first_row * row_bytes;
			if offset + buffer.len() as u64 > *size {
				return Err(failure(FailureKind::OutOfRange, "contiguous data shorter than the dataspace"));
			}
			let range = ByteRange::new(address + offset, buffer.len() as u64);
			let bytes = file.read_bulk(&range, buffer.len() as u64).context("while reading contiguous data")?;
			buffer.copy_from_slice(&bytes);
		}
		Layout::Chunked {
			btree_address,
			chunk_dims,
			chunk_rank,
			element_size: chunk_element_size,
		} => {
			if rows > 0 {
				read_chunked(
					file,
					meta,
					*btree_address,
					chunk_dims,
					*chunk_rank,
					*chunk_element_size,
					first_row,
					rows,
					total_cols,
					&mut buffer,
				)?;
			}
		}
	}

	// carve the requested column out of full-width rows
	let column = if total_cols > 1 {
		let mut out = vec![0u8; rows as usize * element_size];
		for row in 0..rows as usize {
			let from = row * row_bytes as usize + col as usize * element_size;
			let to = row * element_size;
			out[to..to + element_size].copy_from_slice(&buffer[from..from + element_size]);
		}
		out
	} else {
		buffer
	};

	let mut column = column;
	normalize_endianness(&mut column, &meta.datatype);
	let element_type = ElementType::from_datatype(&meta.datatype)?;
	Ok(super::array_data::ArrayData::new(element_type, element_size, column))
}

#[allow(clippy::too_many_arguments)]
fn read_chunked(
	file: &ArchiveFile,
	meta: &DatasetMeta,
	btree_address: u64,
	chunk_dims: &[u64; 2],
	chunk_rank: usize,
	chunk_element_size: u64,
	first_row: u64,
	rows: u64,
	total_cols: u64,
	buffer: &mut [u8],
) -> Result<()> {
	let mut chunks = Vec::new();
	collect_chunks(file, btree_address, chunk_rank, first_row, first_row + rows, chunk_dims, &mut chunks)?;

	let element_size = meta.datatype.size;
	if chunk_element_size != element_size as u64 {
		return Err(failure(
			FailureKind::UnsupportedFormat,
			format!("chunk element size {chunk_element_size} differs from the datatype size {element_size}"),
		));
	}
	let chunk_rows = chunk_dims[0];
	let chunk_cols = if chunk_rank >= 2 { chunk_dims[1] } else { 1 };
	let row_bytes = (total_cols as usize) * element_size;

	for (key, address) in chunks {
		let raw = file
			.read_bulk(&ByteRange::new(address, u64::from(key.chunk_size)), u64::from(key.chunk_size))
			.with_context(|| format!("while reading the chunk at {address:#X}"))?;
		let decoded = decode_chunk(raw, &meta.filters, key.filter_mask, element_size)
			.with_context(|| format!("while decoding the chunk at {address:#X}"))?;

		let chunk_row0 = key.start[0];
		let chunk_col0 = if chunk_rank >= 2 { key.start[1] } else { 0 };

		let row_lo = chunk_row0.max(first_row);
		let row_hi = (chunk_row0 + chunk_rows).min(first_row + rows);
		let col_lo = chunk_col0;
		let col_hi = (chunk_col0 + chunk_cols).min(total_cols);
		trace!("chunk at {address:#X} covers rows {chunk_row0}.. copying {row_lo}..{row_hi}");

		for row in row_lo..row_hi {
			let src_row = (row - chunk_row0) as usize;
			let src = src_row * (chunk_cols as usize) * element_size;
			let dst_row = (row - first_row) as usize;
			let dst = dst_row * row_bytes + (col_lo as usize) * element_size;
			let bytes = ((col_hi - col_lo) as usize) * element_size;
			if src + bytes > decoded.len() {
				return Err(failure(FailureKind::FilterError, "decoded chunk smaller than its declared shape"));
			}
			buffer[dst..dst + bytes].copy_from_slice(&decoded[src..src + bytes]);
		}
	}
	Ok(())
}

/// Walks a version-1 B-tree of raw data chunks, collecting every chunk whose
/// row range intersects `[row_lo, row_hi)`.
fn collect_chunks(
	file: &ArchiveFile,
	mut pos: u64,
	chunk_rank: usize,
	row_lo: u64,
	row_hi: u64,
	chunk_dims: &[u64; 2],
	into: &mut Vec<(ChunkKey, u64)>,
) -> Result<()> {
	let signature = file.read_field(4, &mut pos)? as u32;
	if signature != TREE_SIGNATURE {
		return Err(failure(
			FailureKind::UnsupportedFormat,
			format!("bad chunk B-tree signature {signature:#010X}"),
		));
	}
	let node_type = file.read_field(1, &mut pos)?;
	if node_type != 1 {
		return Err(failure(
			FailureKind::UnsupportedFormat,
			format!("chunk B-tree node type {node_type}"),
		));
	}
	let node_level = file.read_field(1, &mut pos)?;
	let entries_used = file.read_field(2, &mut pos)?;
	let _left_sibling = file.read_offset(&mut pos)?;
	let _right_sibling = file.read_offset(&mut pos)?;

	// keys alternate with children; one trailing key closes the node
	let mut keys = Vec::with_capacity(entries_used as usize + 1);
	let mut children = Vec::with_capacity(entries_used as usize);
	for index in 0..=entries_used {
		keys.push(read_chunk_key(file, chunk_rank, &mut pos)?);
		if index < entries_used {
			children.push(file.read_offset(&mut pos)?);
		}
	}

	for (index, child) in children.iter().enumerate() {
		let covers_from = keys[index].start[0];
		let covers_to = keys[index + 1].start[0];
		// the trailing key of a rightmost node repeats the dimension sizes;
		// treat an empty-looking span as open-ended
		let open_ended = covers_to <= covers_from;
		if covers_from >= row_hi {
			break;
		}
		if !open_ended && covers_to <= row_lo && node_level > 0 {
			continue;
		}
		if node_level > 0 {
			collect_chunks(file, *child, chunk_rank, row_lo, row_hi, chunk_dims, into)?;
		} else {
			let chunk_row0 = keys[index].start[0];
			if chunk_row0 + chunk_dims[0] > row_lo && chunk_row0 < row_hi {
				into.push((
					ChunkKey {
						chunk_size: keys[index].chunk_size,
						filter_mask: keys[index].filter_mask,
						start: keys[index].start,
					},
					*child,
				));
			}
		}
	}
	Ok(())
}

fn read_chunk_key(file: &ArchiveFile, chunk_rank: usize, pos: &mut u64) -> Result<ChunkKey> {
	let chunk_size = file.read_field(4, pos)? as u32;
	let filter_mask = file.read_field(4, pos)? as u32;
	let mut start = [0u64; 2];
	for dim in start.iter_mut().take(chunk_rank) {
		*dim = file.read_field(8, pos)?;
	}
	// the trailing element-size dimension of the key
	let _element_offset = file.read_field(8, pos)?;
	Ok(ChunkKey {
		chunk_size,
		filter_mask,
		start,
	})
}
