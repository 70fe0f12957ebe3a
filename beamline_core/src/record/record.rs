//! The [`Record`] type: one self-describing binary record.
//!
//! Wire layout is the NUL-terminated type name followed by the record body.
//! Typed access goes through the registered definition; every accessor
//! bounds-checks before touching the buffer, so a malformed record surfaces a
//! failure kind instead of corrupting the process.

use super::definition::{RecordDefinition, lookup_definition};
use super::field::{FieldType, RecordField, pack_bit_field, unpack_bit_field};
use crate::failure::{FailureKind, failure};
use anyhow::Result;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::sync::Arc;

/// One typed record backed by a contiguous buffer.
#[derive(Clone, Debug)]
pub struct Record {
	definition: Arc<RecordDefinition>,
	buffer: Vec<u8>,
}

impl Record {
	/// Creates a zeroed record of the registered type's fixed size.
	pub fn new(type_name: &str) -> Result<Record> {
		let definition = lookup_definition(type_name)?;
		let data_size = definition.data_size;
		Self::build(definition, data_size)
	}

	/// Creates a zeroed record with an explicit body size, for types with a
	/// variable tail. `data_size` must cover at least the fixed body.
	pub fn with_data_size(type_name: &str, data_size: usize) -> Result<Record> {
		let definition = lookup_definition(type_name)?;
		if data_size < definition.data_size {
			return Err(failure(
				FailureKind::UndersizedBuffer,
				format!(
					"body of {data_size} bytes is smaller than the fixed {} bytes of '{type_name}'",
					definition.data_size
				),
			));
		}
		Self::build(definition, data_size)
	}

	fn build(definition: Arc<RecordDefinition>, data_size: usize) -> Result<Record> {
		let mut buffer = Vec::with_capacity(definition.type_size + data_size);
		buffer.extend_from_slice(definition.type_name.as_bytes());
		buffer.push(0);
		buffer.resize(definition.type_size + data_size, 0);
		Ok(Record { definition, buffer })
	}

	/// Deserializes a record, verifying the embedded type-name prefix
	/// byte-for-byte against the registry.
	pub fn from_bytes(bytes: &[u8]) -> Result<Record> {
		let nul = bytes
			.iter()
			.position(|&b| b == 0)
			.ok_or_else(|| failure(FailureKind::UnknownRecordType, "record buffer has no type-name terminator"))?;
		let type_name = std::str::from_utf8(&bytes[..nul])
			.map_err(|_| failure(FailureKind::UnknownRecordType, "record type name is not valid UTF-8"))?;
		let definition = lookup_definition(type_name)?;
		if bytes.len() < definition.type_size + definition.data_size {
			return Err(failure(
				FailureKind::UndersizedBuffer,
				format!(
					"'{type_name}' record needs {} bytes, got {}",
					definition.type_size + definition.data_size,
					bytes.len()
				),
			));
		}
		Ok(Record {
			definition,
			buffer: bytes.to_vec(),
		})
	}

	/// The registered type name.
	#[must_use]
	pub fn type_name(&self) -> &str {
		&self.definition.type_name
	}

	/// The definition backing this record.
	#[must_use]
	pub fn definition(&self) -> &Arc<RecordDefinition> {
		&self.definition
	}

	/// The record body, without the type-name prefix.
	#[must_use]
	pub fn data(&self) -> &[u8] {
		&self.buffer[self.definition.type_size..]
	}

	/// Mutable access to the record body.
	pub fn data_mut(&mut self) -> &mut [u8] {
		let start = self.definition.type_size;
		&mut self.buffer[start..]
	}

	/// Serializes into a caller-supplied buffer. Fails with an undersized
	/// buffer kind when `dst` is too small; returns the bytes written.
	pub fn serialize_into(&self, dst: &mut [u8]) -> Result<usize> {
		if dst.len() < self.buffer.len() {
			return Err(failure(
				FailureKind::UndersizedBuffer,
				format!("need {} bytes, caller supplied {}", self.buffer.len(), dst.len()),
			));
		}
		dst[..self.buffer.len()].copy_from_slice(&self.buffer);
		Ok(self.buffer.len())
	}

	/// Serializes into a freshly allocated buffer owned by the caller.
	#[must_use]
	pub fn serialize(&self) -> Vec<u8> {
		self.buffer.clone()
	}

	/// The serialized bytes by reference, valid while the record lives.
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.buffer
	}

	/// Total serialized length.
	#[must_use]
	pub fn len(&self) -> usize {
		self.buffer.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}

	fn field(&self, name: &str) -> Result<RecordField> {
		Ok(self.definition.field(name)?.clone())
	}

	/// Resolves the byte position of `element` of `field` within the body,
	/// following a pointer indirection when flagged and bounds-checking both
	/// the slot and the target.
	fn element_position(&self, field: &RecordField, element: u32) -> Result<usize> {
		if field.elements > 0 && element >= field.elements {
			return Err(failure(
				FailureKind::OutOfRange,
				format!("element {element} beyond declared count {}", field.elements),
			));
		}
		let size = field.field_type.size_bytes();
		let data = self.data();
		let base = if field.is_pointer() {
			// the inline value is a byte offset from the record body base
			let slot = field.byte_offset();
			if slot + 4 > data.len() {
				return Err(failure(FailureKind::OutOfRange, "pointer slot beyond record body"));
			}
			let target = LittleEndian::read_u32(&data[slot..slot + 4]) as usize;
			if target == 0 {
				return Err(failure(FailureKind::BadNullPointer, "pointer field holds 0"));
			}
			target
		} else {
			field.byte_offset()
		};
		let position = base + element as usize * size;
		if position + size > data.len() {
			return Err(failure(
				FailureKind::OutOfRange,
				format!("field bytes {position}..{} beyond record body of {}", position + size, data.len()),
			));
		}
		Ok(position)
	}

	/// Reads a field as an integer.
	pub fn get_integer(&self, name: &str, element: u32) -> Result<i64> {
		let field = self.field(name)?;
		if field.field_type == FieldType::BitField {
			if element != 0 {
				return Err(failure(FailureKind::OutOfRange, "bitfields have a single element"));
			}
			return Ok(unpack_bit_field(self.data(), field.bit_offset, field.elements) as i64);
		}
		let pos = self.element_position(&field, element)?;
		let bytes = &self.data()[pos..];
		let value = if field.is_big_endian() {
			read_integer::<BigEndian>(field.field_type, bytes)?
		} else {
			read_integer::<LittleEndian>(field.field_type, bytes)?
		};
		Ok(value)
	}

	/// Reads a field as a floating-point value, converting integers.
	pub fn get_real(&self, name: &str, element: u32) -> Result<f64> {
		let field = self.field(name)?;
		match field.field_type {
			FieldType::Float => {
				let pos = self.element_position(&field, element)?;
				let bytes = &self.data()[pos..];
				Ok(f64::from(if field.is_big_endian() {
					BigEndian::read_f32(bytes)
				} else {
					LittleEndian::read_f32(bytes)
				}))
			}
			FieldType::Double => {
				let pos = self.element_position(&field, element)?;
				let bytes = &self.data()[pos..];
				Ok(if field.is_big_endian() {
					BigEndian::read_f64(bytes)
				} else {
					LittleEndian::read_f64(bytes)
				})
			}
			_ => Ok(self.get_integer(name, element)? as f64),
		}
	}

	/// Reads a string field: bytes up to the declared count or the first NUL.
	pub fn get_text(&self, name: &str) -> Result<String> {
		let field = self.field(name)?;
		if field.field_type != FieldType::Str {
			return Err(failure(FailureKind::UnknownRecordType, format!("field '{name}' is not a string")));
		}
		let start = self.element_position(&field, 0)?;
		let data = self.data();
		let max = if field.elements == 0 {
			data.len()
		} else {
			(start + field.elements as usize).min(data.len())
		};
		let slice = &data[start..max];
		let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
		Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
	}

	/// Writes an integer field.
	pub fn set_integer(&mut self, name: &str, element: u32, value: i64) -> Result<()> {
		let field = self.field(name)?;
		if field.field_type == FieldType::BitField {
			if element != 0 {
				return Err(failure(FailureKind::OutOfRange, "bitfields have a single element"));
			}
			let bit_offset = field.bit_offset;
			let bits = field.elements;
			pack_bit_field(self.data_mut(), bit_offset, bits, value as u64);
			return Ok(());
		}
		let pos = self.element_position(&field, element)?;
		let bytes = &mut self.data_mut()[pos..];
		if field.is_big_endian() {
			write_integer::<BigEndian>(field.field_type, bytes, value)?;
		} else {
			write_integer::<LittleEndian>(field.field_type, bytes, value)?;
		}
		Ok(())
	}

	/// Writes a floating-point field.
	pub fn set_real(&mut self, name: &str, element: u32, value: f64) -> Result<()> {
		let field = self.field(name)?;
		match field.field_type {
			FieldType::Float => {
				let pos = self.element_position(&field, element)?;
				let bytes = &mut self.data_mut()[pos..];
				if field.is_big_endian() {
					BigEndian::write_f32(bytes, value as f32);
				} else {
					LittleEndian::write_f32(bytes, value as f32);
				}
				Ok(())
			}
			FieldType::Double => {
				let pos = self.element_position(&field, element)?;
				let bytes = &mut self.data_mut()[pos..];
				if field.is_big_endian() {
					BigEndian::write_f64(bytes, value);
				} else {
					LittleEndian::write_f64(bytes, value);
				}
				Ok(())
			}
			_ => self.set_integer(name, element, value as i64),
		}
	}

	/// Writes a string field, NUL-terminated, truncated to the declared count.
	pub fn set_text(&mut self, name: &str, value: &str) -> Result<()> {
		let field = self.field(name)?;
		if field.field_type != FieldType::Str {
			return Err(failure(FailureKind::UnknownRecordType, format!("field '{name}' is not a string")));
		}
		let start = self.element_position(&field, 0)?;
		let data_len = self.data().len();
		let capacity = if field.elements == 0 {
			data_len - start
		} else {
			(field.elements as usize).min(data_len - start)
		};
		let bytes = value.as_bytes();
		let copy = bytes.len().min(capacity.saturating_sub(1));
		let body = self.data_mut();
		body[start..start + copy].copy_from_slice(&bytes[..copy]);
		body[start + copy] = 0;
		Ok(())
	}

	/// Value of the definition's id field, when one is declared.
	pub fn record_id(&self) -> Result<i64> {
		match &self.definition.id_field {
			Some(field) => self.get_integer(&field.clone(), 0),
			None => Ok(0),
		}
	}

	/// Populates fields from a `name=value, name=value` string. Values parse
	/// as floats, integers, or fall back to text by field type.
	pub fn populate(&mut self, assignments: &str) -> Result<()> {
		for assignment in assignments.split(',') {
			let assignment = assignment.trim();
			if assignment.is_empty() {
				continue;
			}
			let (name, value) = assignment.split_once('=').ok_or_else(|| {
				failure(
					FailureKind::UnknownRecordType,
					format!("assignment '{assignment}' is not name=value"),
				)
			})?;
			let name = name.trim();
			let value = value.trim();
			let field = self.field(name)?;
			match field.field_type {
				FieldType::Str => self.set_text(name, value)?,
				FieldType::Float | FieldType::Double => {
					let parsed: f64 = value
						.parse()
						.map_err(|_| failure(FailureKind::UnknownRecordType, format!("'{value}' is not a real number")))?;
					self.set_real(name, 0, parsed)?;
				}
				_ => {
					let parsed: i64 = value
						.parse()
						.map_err(|_| failure(FailureKind::UnknownRecordType, format!("'{value}' is not an integer")))?;
					self.set_integer(name, 0, parsed)?;
				}
			}
		}
		Ok(())
	}
}

fn read_integer<E: ByteOrder>(field_type: FieldType, bytes: &[u8]) -> Result<i64> {
	Ok(match field_type {
		FieldType::Int8 => i64::from(bytes[0] as i8),
		FieldType::UInt8 => i64::from(bytes[0]),
		FieldType::Int16 => i64::from(E::read_i16(bytes)),
		FieldType::UInt16 => i64::from(E::read_u16(bytes)),
		FieldType::Int32 => i64::from(E::read_i32(bytes)),
		FieldType::UInt32 => i64::from(E::read_u32(bytes)),
		FieldType::Int64 | FieldType::Time8 => E::read_i64(bytes),
		FieldType::UInt64 => E::read_u64(bytes) as i64,
		FieldType::Float => E::read_f32(bytes) as i64,
		FieldType::Double => E::read_f64(bytes) as i64,
		other => {
			return Err(failure(
				FailureKind::UnknownRecordType,
				format!("cannot read {other:?} as an integer"),
			));
		}
	})
}

fn write_integer<E: ByteOrder>(field_type: FieldType, bytes: &mut [u8], value: i64) -> Result<()> {
	match field_type {
		FieldType::Int8 | FieldType::UInt8 => bytes[0] = value as u8,
		FieldType::Int16 => E::write_i16(bytes, value as i16),
		FieldType::UInt16 => E::write_u16(bytes, value as u16),
		FieldType::Int32 => E::write_i32(bytes, value as i32),
		FieldType::UInt32 => E::write_u32(bytes, value as u32),
		FieldType::Int64 | FieldType::Time8 => E::write_i64(bytes, value),
		FieldType::UInt64 => E::write_u64(bytes, value as u64),
		other => {
			return Err(failure(
				FailureKind::UnknownRecordType,
				format!("cannot write {other:?} as an integer"),
			));
		}
	}
	Ok(())
}
