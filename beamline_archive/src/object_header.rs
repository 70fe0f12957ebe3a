//! Object header traversal: resolving a `/group/.../dataset` path to the
//! dataset's metadata by walking headers, links and continuation chunks.
//!
//! Two header versions are interpreted: version-2 chunks start with `OHDR`
//! and are self-delimiting; version-1 headers carry an explicit size, 8-byte
//! message alignment and no signature. Messages that do not contribute to
//! path resolution or dataset capture are skipped by their declared length.

use super::file::ArchiveFile;
use super::format::{MessageType, OCHK_SIGNATURE, OHDR_SIGNATURE};
use super::metadata::{DatasetMeta, Dataspace, Datatype, DatatypeClass, Filter, FilterKind, Layout};
use beamline_core::failure::{FailureKind, failure};
use anyhow::{Context, Result};
use log::trace;

const V2_SIZE_OF_CHUNK0_MASK: u64 = 0x03;
const V2_ATTR_CREATION_TRACK_BIT: u64 = 0x04;
const V2_STORE_CHANGE_PHASE_BIT: u64 = 0x10;
const V2_FILE_STATS_BIT: u64 = 0x20;

/// Version marker carried through message parsing; version-1 continuation
/// blocks have no signature or checksum.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum HeaderVersion {
	V1,
	V2 { flags: u64 },
}

pub(crate) struct HeaderWalker<'a> {
	pub file: &'a ArchiveFile,
	pub path: Vec<String>,
	pub dataspace: Option<Dataspace>,
	pub datatype: Option<Datatype>,
	pub layout: Option<Layout>,
	pub filters: Vec<Filter>,
	pub fill: Option<Vec<u8>>,
	reached_dataset: bool,
	done: bool,
}

impl<'a> HeaderWalker<'a> {
	pub fn new(file: &'a ArchiveFile, path: &[String]) -> Self {
		Self {
			file,
			path: path.to_vec(),
			dataspace: None,
			datatype: None,
			layout: None,
			filters: Vec::new(),
			fill: None,
			reached_dataset: false,
			done: false,
		}
	}

	/// Resolves the walker's path starting at the root group header.
	pub fn resolve(mut self) -> Result<DatasetMeta> {
		let root = self.file.superblock.root_group_address;
		self
			.read_object_header(root, 0)
			.with_context(|| format!("while resolving '/{}'", self.path.join("/")))?;

		if !self.reached_dataset {
			return Err(failure(
				FailureKind::ResourceMissing,
				format!("dataset '/{}' not found in '{}'", self.path.join("/"), self.file.name()),
			));
		}
		let datatype = self
			.datatype
			.ok_or_else(|| failure(FailureKind::UnsupportedFormat, "dataset header carries no datatype"))?;
		let dataspace = self
			.dataspace
			.ok_or_else(|| failure(FailureKind::UnsupportedFormat, "dataset header carries no dataspace"))?;
		let layout = self
			.layout
			.ok_or_else(|| failure(FailureKind::UnsupportedFormat, "dataset header carries no layout"))?;
		Ok(DatasetMeta {
			datatype,
			dataspace,
			layout,
			filters: self.filters,
			fill: self.fill,
		})
	}

	/// Whether messages at this level describe the target dataset.
	fn at_dataset_level(&self, dlvl: usize) -> bool {
		dlvl == self.path.len()
	}

	/// Whether the target dataset header has been fully parsed; enclosing
	/// group walks stop early once it has.
	pub(crate) fn is_done(&self) -> bool {
		self.done
	}

	/// Reads the object header at `pos`, dispatching on its version.
	pub fn read_object_header(&mut self, pos: u64, dlvl: usize) -> Result<()> {
		if self.at_dataset_level(dlvl) {
			self.reached_dataset = true;
		}
		let mut peek = pos;
		let maybe_signature = self.file.read_field(4, &mut peek)? as u32;
		if maybe_signature == OHDR_SIGNATURE {
			self.read_object_header_v2(pos, dlvl)?;
		} else {
			self.read_object_header_v1(pos, dlvl)?;
		}
		if self.at_dataset_level(dlvl) {
			// the target header is fully parsed; stop enclosing group walks
			self.done = true;
		}
		Ok(())
	}

	fn read_object_header_v2(&mut self, mut pos: u64, dlvl: usize) -> Result<()> {
		pos += 4; // signature
		let version = self.file.read_field(1, &mut pos)?;
		if version != 2 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("object header chunk version {version}"),
			));
		}
		let flags = self.file.read_field(1, &mut pos)?;
		if flags & V2_FILE_STATS_BIT != 0 {
			pos += 16; // four time fields
		}
		if flags & V2_STORE_CHANGE_PHASE_BIT != 0 {
			pos += 4; // compact/dense phase bounds
		}
		let size_of_chunk0 = self.file.read_field(1usize << (flags & V2_SIZE_OF_CHUNK0_MASK), &mut pos)?;
		let end = pos + size_of_chunk0;
		self.read_messages(pos, end, HeaderVersion::V2 { flags }, dlvl)
	}

	fn read_object_header_v1(&mut self, mut pos: u64, dlvl: usize) -> Result<()> {
		let version = self.file.read_field(1, &mut pos)?;
		if version != 1 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("object header version {version}"),
			));
		}
		pos += 1; // reserved
		let _num_messages = self.file.read_field(2, &mut pos)?;
		let _reference_count = self.file.read_field(4, &mut pos)?;
		let header_size = self.file.read_field(4, &mut pos)?;
		pos += 4; // pad to 8-byte alignment
		let end = pos + header_size;
		self.read_messages(pos, end, HeaderVersion::V1, dlvl)
	}

	/// Walks the message stream of one header chunk.
	pub(crate) fn read_messages(&mut self, mut pos: u64, end: u64, version: HeaderVersion, dlvl: usize) -> Result<()> {
		let header_bytes: u64 = match version {
			HeaderVersion::V1 => 8,
			HeaderVersion::V2 { flags } => {
				if flags & V2_ATTR_CREATION_TRACK_BIT != 0 {
					6
				} else {
					4
				}
			}
		};

		while pos + header_bytes <= end && !self.done {
			let (msg_type, msg_size) = match version {
				HeaderVersion::V1 => {
					let t = self.file.read_field(2, &mut pos)?;
					let s = self.file.read_field(2, &mut pos)?;
					pos += 4; // flags plus reserved
					(t as u16, s)
				}
				HeaderVersion::V2 { flags } => {
					let t = self.file.read_field(1, &mut pos)?;
					let s = self.file.read_field(2, &mut pos)?;
					pos += 1; // flags
					if flags & V2_ATTR_CREATION_TRACK_BIT != 0 {
						pos += 2; // creation order
					}
					(t as u16, s)
				}
			};

			self
				.read_message(MessageType::from(msg_type), msg_size, pos, version, dlvl)
				.with_context(|| format!("while reading message type {msg_type:#04X} at {pos:#X}"))?;
			pos += msg_size;
		}
		Ok(())
	}

	fn read_message(
		&mut self,
		msg_type: MessageType,
		msg_size: u64,
		pos: u64,
		version: HeaderVersion,
		dlvl: usize,
	) -> Result<()> {
		match msg_type {
			MessageType::Dataspace if self.at_dataset_level(dlvl) => self.read_dataspace_msg(pos),
			MessageType::Datatype if self.at_dataset_level(dlvl) => self.read_datatype_msg(pos),
			MessageType::FillValue if self.at_dataset_level(dlvl) => self.read_fill_value_msg(pos),
			MessageType::DataLayout if self.at_dataset_level(dlvl) => self.read_data_layout_msg(pos),
			MessageType::FilterPipeline if self.at_dataset_level(dlvl) => self.read_filter_pipeline_msg(pos),
			MessageType::LinkInfo if !self.at_dataset_level(dlvl) => self.read_link_info_msg(pos, version, dlvl),
			MessageType::Link if !self.at_dataset_level(dlvl) => self.read_link_msg(pos, dlvl).map(|_| ()),
			MessageType::SymbolTable if !self.at_dataset_level(dlvl) => self.read_symbol_table_msg(pos, dlvl),
			MessageType::HeaderContinuation => self.read_continuation_msg(pos, version, dlvl),
			other => {
				trace!("skipping message {other:?} of {msg_size} bytes at {pos:#X}");
				Ok(())
			}
		}
	}

	fn read_dataspace_msg(&mut self, mut pos: u64) -> Result<()> {
		let version = self.file.read_field(1, &mut pos)?;
		let rank = self.file.read_field(1, &mut pos)? as usize;
		let _flags = self.file.read_field(1, &mut pos)?;
		match version {
			1 => pos += 5, // reserved
			2 => pos += 1, // dataspace type
			other => {
				return Err(failure(
					FailureKind::UnsupportedFormat,
					format!("dataspace message version {other}"),
				));
			}
		}
		if rank > 2 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("dataset rank {rank} exceeds the supported 2"),
			));
		}
		let mut dims = [0u64; 2];
		for dim in dims.iter_mut().take(rank) {
			*dim = self.file.read_length(&mut pos)?;
		}
		self.dataspace = Some(Dataspace { rank, dims });
		Ok(())
	}

	fn read_datatype_msg(&mut self, mut pos: u64) -> Result<()> {
		let class_and_version = self.file.read_field(1, &mut pos)?;
		let version = class_and_version >> 4;
		let class = class_and_version & 0x0F;
		if !(1..=3).contains(&version) {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("datatype message version {version}"),
			));
		}
		let bits0 = self.file.read_field(1, &mut pos)?;
		let _bits8 = self.file.read_field(1, &mut pos)?;
		let _bits16 = self.file.read_field(1, &mut pos)?;
		let size = self.file.read_field(4, &mut pos)? as usize;

		let big_endian = bits0 & 0x01 != 0;
		let datatype = match class {
			0 => Datatype {
				class: DatatypeClass::FixedPoint,
				size,
				signed: bits0 & 0x08 != 0,
				big_endian,
			},
			1 => Datatype {
				class: DatatypeClass::FloatingPoint,
				size,
				signed: true,
				big_endian,
			},
			3 => Datatype {
				class: DatatypeClass::Str,
				size,
				signed: false,
				big_endian: false,
			},
			6 => Datatype {
				class: DatatypeClass::Compound,
				size,
				signed: false,
				big_endian: false,
			},
			other => {
				return Err(failure(
					FailureKind::UnsupportedFormat,
					format!("datatype class {other} is not supported"),
				));
			}
		};
		self.datatype = Some(datatype);
		Ok(())
	}

	fn read_fill_value_msg(&mut self, mut pos: u64) -> Result<()> {
		let version = self.file.read_field(1, &mut pos)?;
		match version {
			1 | 2 => {
				pos += 2; // allocation and write time
				let defined = self.file.read_field(1, &mut pos)?;
				if version == 1 || defined != 0 {
					let size = self.file.read_field(4, &mut pos)? as usize;
					if size > 0 {
						self.fill = Some(self.file.read_bytes(size, &mut pos)?);
					}
				}
			}
			3 => {
				let flags = self.file.read_field(1, &mut pos)?;
				if flags & 0x20 != 0 {
					let size = self.file.read_field(4, &mut pos)? as usize;
					if size > 0 {
						self.fill = Some(self.file.read_bytes(size, &mut pos)?);
					}
				}
			}
			_ => {} // no fill information worth failing over
		}
		Ok(())
	}

	fn read_data_layout_msg(&mut self, mut pos: u64) -> Result<()> {
		let version = self.file.read_field(1, &mut pos)?;
		if version != 3 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("data layout message version {version}"),
			));
		}
		let class = self.file.read_field(1, &mut pos)?;
		let layout = match class {
			0 => {
				let size = self.file.read_field(2, &mut pos)? as usize;
				Layout::Compact(self.file.read_bytes(size, &mut pos)?)
			}
			1 => {
				let address = self.file.read_offset(&mut pos)?;
				let size = self.file.read_length(&mut pos)?;
				Layout::Contiguous { address, size }
			}
			2 => {
				let dimensionality = self.file.read_field(1, &mut pos)? as usize;
				let btree_address = self.file.read_offset(&mut pos)?;
				if dimensionality < 2 || dimensionality > 3 {
					return Err(failure(
						FailureKind::UnsupportedFormat,
						format!("chunk dimensionality {dimensionality} exceeds the supported rank"),
					));
				}
				let chunk_rank = dimensionality - 1;
				let mut chunk_dims = [1u64; 2];
				for dim in chunk_dims.iter_mut().take(chunk_rank) {
					*dim = self.file.read_field(4, &mut pos)?;
				}
				let element_size = self.file.read_field(4, &mut pos)?;
				Layout::Chunked {
					btree_address,
					chunk_dims,
					chunk_rank,
					element_size,
				}
			}
			other => {
				return Err(failure(FailureKind::UnsupportedFormat, format!("layout class {other}")));
			}
		};
		self.layout = Some(layout);
		Ok(())
	}

	fn read_filter_pipeline_msg(&mut self, mut pos: u64) -> Result<()> {
		let version = self.file.read_field(1, &mut pos)?;
		let nfilters = self.file.read_field(1, &mut pos)?;
		match version {
			1 => pos += 6, // reserved
			2 => {}
			other => {
				return Err(failure(
					FailureKind::UnsupportedFormat,
					format!("filter pipeline message version {other}"),
				));
			}
		}
		for _ in 0..nfilters {
			let id = self.file.read_field(2, &mut pos)? as u16;
			let name_length = if version == 1 || id >= 256 {
				self.file.read_field(2, &mut pos)? as u64
			} else {
				0
			};
			let _flags = self.file.read_field(2, &mut pos)?;
			let num_client_values = self.file.read_field(2, &mut pos)? as usize;
			// name, padded to a multiple of eight in version 1
			let padded_name = if version == 1 {
				name_length.div_ceil(8) * 8
			} else {
				name_length
			};
			pos += padded_name;

			let mut client_data = Vec::with_capacity(num_client_values);
			for _ in 0..num_client_values {
				client_data.push(self.file.read_field(4, &mut pos)? as u32);
			}
			if version == 1 && num_client_values % 2 == 1 {
				pos += 4; // pad to a multiple of eight
			}
			self.filters.push(Filter {
				kind: FilterKind::from_id(id),
				client_data,
			});
		}
		Ok(())
	}

	fn read_link_info_msg(&mut self, mut pos: u64, version: HeaderVersion, dlvl: usize) -> Result<()> {
		let msg_version = self.file.read_field(1, &mut pos)?;
		if msg_version != 0 {
			return Err(failure(
				FailureKind::UnsupportedFormat,
				format!("link info message version {msg_version}"),
			));
		}
		let flags = self.file.read_field(1, &mut pos)?;
		if flags & 0x01 != 0 {
			pos += 8; // maximum creation index
		}
		let heap_address = self.file.read_offset(&mut pos)?;
		let _name_index = self.file.read_offset(&mut pos)?;
		if flags & 0x02 != 0 {
			pos += 8; // creation order index
		}
		if !self.file.is_undefined(heap_address) {
			self.read_fractal_heap(heap_address, version, dlvl)?;
		}
		Ok(())
	}

	/// Parses one link message. Returns the bytes consumed so fractal-heap
	/// direct blocks can pack several link messages back to back.
	pub(crate) fn read_link_msg(&mut self, pos: u64, dlvl: usize) -> Result<u64> {
		const SIZE_OF_LEN_OF_NAME_MASK: u64 = 0x03;
		const CREATE_ORDER_PRESENT_BIT: u64 = 0x04;
		const LINK_TYPE_PRESENT_BIT: u64 = 0x08;
		const CHAR_SET_PRESENT_BIT: u64 = 0x10;

		let start = pos;
		let mut pos = pos;
		let version = self.file.read_field(1, &mut pos)?;
		if version != 1 {
			return Err(failure(FailureKind::UnsupportedFormat, format!("link message version {version}")));
		}
		let flags = self.file.read_field(1, &mut pos)?;

		let mut link_type = 0u64;
		if flags & LINK_TYPE_PRESENT_BIT != 0 {
			link_type = self.file.read_field(1, &mut pos)?;
		}
		if flags & CREATE_ORDER_PRESENT_BIT != 0 {
			pos += 8;
		}
		if flags & CHAR_SET_PRESENT_BIT != 0 {
			pos += 1;
		}
		let name_length_size = 1usize << (flags & SIZE_OF_LEN_OF_NAME_MASK);
		let name_length = self.file.read_field(name_length_size, &mut pos)? as usize;
		let name_bytes = self.file.read_bytes(name_length, &mut pos)?;
		let name = String::from_utf8_lossy(&name_bytes).into_owned();

		match link_type {
			0 => {
				// hard link
				let child_address = self.file.read_offset(&mut pos)?;
				trace!("link '{name}' -> {child_address:#X} at level {dlvl}");
				if dlvl < self.path.len() && name == self.path[dlvl] {
					self.read_object_header(child_address, dlvl + 1)?;
				}
			}
			1 | 64 => {
				// soft and external links name a path instead; not followed
				let target_length = self.file.read_field(2, &mut pos)?;
				pos += target_length;
			}
			other => {
				return Err(failure(FailureKind::UnsupportedFormat, format!("link type {other}")));
			}
		}
		Ok(pos - start)
	}

	fn read_continuation_msg(&mut self, mut pos: u64, version: HeaderVersion, dlvl: usize) -> Result<()> {
		let offset = self.file.read_offset(&mut pos)?;
		let length = self.file.read_length(&mut pos)?;
		match version {
			HeaderVersion::V1 => self.read_messages(offset, offset + length, version, dlvl),
			HeaderVersion::V2 { .. } => {
				let mut block = offset;
				let signature = self.file.read_field(4, &mut block)? as u32;
				if signature != OCHK_SIGNATURE {
					return Err(failure(
						FailureKind::UnsupportedFormat,
						format!("bad continuation signature {signature:#010X} at {offset:#X}"),
					));
				}
				// the last four bytes hold the chunk checksum
				self.read_messages(block, offset + length - 4, version, dlvl)
			}
		}
	}
}
