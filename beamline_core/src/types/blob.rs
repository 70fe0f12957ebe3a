//! This module provides the [`Blob`] struct, a wrapper around [`Vec<u8>`] used
//! for every byte payload that moves through the pipeline: cache lines fetched
//! from object storage, decompressed chunks, and serialized records.

use super::ByteRange;
use anyhow::{Result, bail};
use std::fmt::Debug;
use std::ops::Range;

/// A simple wrapper around [`Vec<u8>`] with helpers for slicing and ranged access.
///
/// # Examples
///
/// ```rust
/// use beamline_core::Blob;
///
/// let blob = Blob::from(vec![0u8, 1, 2, 3, 4]);
/// assert_eq!(blob.len(), 5);
/// assert_eq!(blob.range(1..3), &[1, 2]);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Blob(Vec<u8>);

impl Blob {
	/// Creates an empty `Blob`.
	#[must_use]
	pub fn new_empty() -> Blob {
		Blob(Vec::new())
	}

	/// Creates a `Blob` of the specified size, filled with zeros.
	#[must_use]
	pub fn new_sized(length: usize) -> Blob {
		Blob(vec![0u8; length])
	}

	/// Returns a byte slice covering `range`.
	///
	/// # Panics
	///
	/// Panics if the range is out of bounds.
	#[must_use]
	pub fn range(&self, range: Range<usize>) -> &[u8] {
		&self.0[range]
	}

	/// Returns a new `Blob` containing the bytes of `range`, or an error if the
	/// range reaches past the end.
	pub fn read_range(&self, range: &ByteRange) -> Result<Blob> {
		let r = range.as_range_usize();
		if r.end > self.0.len() {
			bail!("byte range {range:?} exceeds blob of {} bytes", self.0.len());
		}
		Ok(Blob(self.0[r].to_vec()))
	}

	/// Returns the contents as a byte slice.
	#[must_use]
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Returns the contents as a mutable byte slice.
	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.0
	}

	/// Consumes the `Blob` and returns the underlying vector.
	#[must_use]
	pub fn into_vec(self) -> Vec<u8> {
		self.0
	}

	/// Interprets the contents as UTF-8 text, lossily.
	#[must_use]
	pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
		String::from_utf8_lossy(&self.0)
	}

	/// Returns the length in bytes.
	#[must_use]
	pub fn len(&self) -> u64 {
		self.0.len() as u64
	}

	/// Returns `true` when the blob holds no bytes.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl From<Vec<u8>> for Blob {
	fn from(value: Vec<u8>) -> Self {
		Blob(value)
	}
}

impl From<&[u8]> for Blob {
	fn from(value: &[u8]) -> Self {
		Blob(value.to_vec())
	}
}

impl<const N: usize> From<&[u8; N]> for Blob {
	fn from(value: &[u8; N]) -> Self {
		Blob(value.to_vec())
	}
}

impl From<&str> for Blob {
	fn from(value: &str) -> Self {
		Blob(value.as_bytes().to_vec())
	}
}

impl Debug for Blob {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Blob({} bytes)", self.0.len())
	}
}
