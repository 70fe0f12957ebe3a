//! Mapping from on-disk datatypes to native elements.

use super::metadata::{Datatype, DatatypeClass};
use beamline_core::failure::{FailureKind, failure};
use anyhow::Result;

/// Native element types a read can produce. Strings arrive as zero-terminated
/// bytes; compound elements stay opaque bytes with their schema alongside.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElementType {
	Int8,
	Int16,
	Int32,
	Int64,
	UInt8,
	UInt16,
	UInt32,
	UInt64,
	Float32,
	Float64,
	Bytes,
}

impl ElementType {
	/// Maps a parsed datatype to its native element type.
	pub fn from_datatype(datatype: &Datatype) -> Result<ElementType> {
		match datatype.class {
			DatatypeClass::FixedPoint => match (datatype.size, datatype.signed) {
				(1, true) => Ok(ElementType::Int8),
				(1, false) => Ok(ElementType::UInt8),
				(2, true) => Ok(ElementType::Int16),
				(2, false) => Ok(ElementType::UInt16),
				(4, true) => Ok(ElementType::Int32),
				(4, false) => Ok(ElementType::UInt32),
				(8, true) => Ok(ElementType::Int64),
				(8, false) => Ok(ElementType::UInt64),
				(size, _) => Err(failure(
					FailureKind::UnsupportedFormat,
					format!("fixed-point width {size} is not supported"),
				)),
			},
			DatatypeClass::FloatingPoint => match datatype.size {
				4 => Ok(ElementType::Float32),
				8 => Ok(ElementType::Float64),
				size => Err(failure(
					FailureKind::UnsupportedFormat,
					format!("floating-point width {size} is not supported"),
				)),
			},
			DatatypeClass::Str | DatatypeClass::Compound => Ok(ElementType::Bytes),
		}
	}
}

/// Swaps multi-byte elements in place when the on-disk order differs from the
/// host. Opaque byte elements are never swapped.
pub fn normalize_endianness(data: &mut [u8], datatype: &Datatype) {
	let needs_swap = datatype.big_endian != cfg!(target_endian = "big");
	let swappable = matches!(datatype.class, DatatypeClass::FixedPoint | DatatypeClass::FloatingPoint);
	if !needs_swap || !swappable || datatype.size <= 1 {
		return;
	}
	for element in data.chunks_exact_mut(datatype.size) {
		element.reverse();
	}
}
