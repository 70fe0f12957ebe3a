//! Typed array results: the contiguous elements a slab read produces, with
//! in-place trimming and raw serialization for record embedding.

use super::datatype::ElementType;
use beamline_core::failure::{FailureKind, failure};
use anyhow::Result;

/// One read column of one dataset, in native byte order.
#[derive(Clone, Debug)]
pub struct ArrayData {
	element_type: ElementType,
	type_size: usize,
	data: Vec<u8>,
	/// Elements discarded from the front by [`trim`](Self::trim).
	base: usize,
	count: usize,
}

impl ArrayData {
	#[must_use]
	pub fn new(element_type: ElementType, type_size: usize, data: Vec<u8>) -> Self {
		let count = if type_size == 0 { 0 } else { data.len() / type_size };
		Self {
			element_type,
			type_size,
			data,
			base: 0,
			count,
		}
	}

	#[must_use]
	pub fn element_type(&self) -> ElementType {
		self.element_type
	}

	/// Bytes per element.
	#[must_use]
	pub fn type_size(&self) -> usize {
		self.type_size
	}

	/// Elements visible after trimming.
	#[must_use]
	pub fn len(&self) -> usize {
		self.count - self.base
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Discards the first `k` visible elements in place.
	pub fn trim(&mut self, k: usize) {
		self.base = (self.base + k).min(self.count);
	}

	fn element_bytes(&self, index: usize) -> Result<&[u8]> {
		if index >= self.len() {
			return Err(failure(
				FailureKind::OutOfRange,
				format!("element {index} of {} available", self.len()),
			));
		}
		let at = (self.base + index) * self.type_size;
		Ok(&self.data[at..at + self.type_size])
	}

	/// Element `index` as f64, converting integer types.
	pub fn value_f64(&self, index: usize) -> Result<f64> {
		let bytes = self.element_bytes(index)?;
		Ok(match self.element_type {
			ElementType::Float32 => f64::from(f32::from_ne_bytes(bytes.try_into()?)),
			ElementType::Float64 => f64::from_ne_bytes(bytes.try_into()?),
			_ => self.value_i64(index)? as f64,
		})
	}

	/// Element `index` as i64, converting from any integer width.
	pub fn value_i64(&self, index: usize) -> Result<i64> {
		let bytes = self.element_bytes(index)?;
		Ok(match self.element_type {
			ElementType::Int8 => i64::from(bytes[0] as i8),
			ElementType::UInt8 => i64::from(bytes[0]),
			ElementType::Int16 => i64::from(i16::from_ne_bytes(bytes.try_into()?)),
			ElementType::UInt16 => i64::from(u16::from_ne_bytes(bytes.try_into()?)),
			ElementType::Int32 => i64::from(i32::from_ne_bytes(bytes.try_into()?)),
			ElementType::UInt32 => i64::from(u32::from_ne_bytes(bytes.try_into()?)),
			ElementType::Int64 => i64::from_ne_bytes(bytes.try_into()?),
			ElementType::UInt64 => u64::from_ne_bytes(bytes.try_into()?) as i64,
			ElementType::Float32 => f32::from_ne_bytes(bytes.try_into()?) as i64,
			ElementType::Float64 => f64::from_ne_bytes(bytes.try_into()?) as i64,
			ElementType::Bytes => {
				return Err(failure(FailureKind::UnsupportedFormat, "opaque elements have no integer value"));
			}
		})
	}

	/// Copies the raw bytes of `count` elements starting at visible `row` into
	/// `dst`, for embedding into a record tail.
	pub fn serialize(&self, dst: &mut [u8], row: usize, count: usize) -> Result<usize> {
		if row + count > self.len() {
			return Err(failure(
				FailureKind::OutOfRange,
				format!("rows {row}..{} of {} available", row + count, self.len()),
			));
		}
		let bytes = count * self.type_size;
		if dst.len() < bytes {
			return Err(failure(
				FailureKind::UndersizedBuffer,
				format!("need {bytes} bytes, caller supplied {}", dst.len()),
			));
		}
		let at = (self.base + row) * self.type_size;
		dst[..bytes].copy_from_slice(&self.data[at..at + bytes]);
		Ok(bytes)
	}

	/// The raw visible bytes.
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.data[self.base * self.type_size..self.count * self.type_size]
	}
}
