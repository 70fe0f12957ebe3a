//! Resolved dataset metadata: everything path resolution captures about a
//! dataset, enough to read any slab of it without another header walk.

use beamline_core::failure::{FailureKind, failure};

/// Datatype classes the reader maps to native elements. Compound types stay
/// opaque: the bytes are carried and the schema travels with them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DatatypeClass {
	FixedPoint,
	FloatingPoint,
	Str,
	Compound,
}

/// A dataset's on-disk element type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Datatype {
	pub class: DatatypeClass,
	/// Bytes per element.
	pub size: usize,
	/// Meaningful for fixed-point only.
	pub signed: bool,
	pub big_endian: bool,
}

/// Rank and per-dimension extents. Anything past the second dimension is not
/// supported; the granules this pipeline reads are tables of rows.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Dataspace {
	pub rank: usize,
	pub dims: [u64; 2],
}

impl Dataspace {
	/// Rows: the first dimension, 1 for scalars.
	#[must_use]
	pub fn num_rows(&self) -> u64 {
		if self.rank == 0 { 1 } else { self.dims[0] }
	}

	/// Columns: the second dimension, 1 below rank 2.
	#[must_use]
	pub fn num_cols(&self) -> u64 {
		if self.rank >= 2 { self.dims[1] } else { 1 }
	}

	#[must_use]
	pub fn num_elements(&self) -> u64 {
		self.num_rows() * self.num_cols()
	}
}

/// Where a dataset's bytes live.
#[derive(Clone, PartialEq, Debug)]
pub enum Layout {
	/// Data held inline in the object header.
	Compact(Vec<u8>),
	/// One contiguous run at an address.
	Contiguous { address: u64, size: u64 },
	/// Chunks indexed by a version-1 B-tree.
	Chunked {
		btree_address: u64,
		/// Chunk shape in elements; the trailing element-size dimension of the
		/// on-disk record is stored separately.
		chunk_dims: [u64; 2],
		chunk_rank: usize,
		element_size: u64,
	},
}

/// Filters a chunk passes through, in declaration order. Reads apply the
/// inverses in reverse order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterKind {
	Deflate,
	Shuffle,
	Fletcher32,
	Unsupported(u16),
}

impl FilterKind {
	#[must_use]
	pub fn from_id(id: u16) -> Self {
		match id {
			1 => FilterKind::Deflate,
			2 => FilterKind::Shuffle,
			3 => FilterKind::Fletcher32,
			other => FilterKind::Unsupported(other),
		}
	}
}

#[derive(Clone, PartialEq, Debug)]
pub struct Filter {
	pub kind: FilterKind,
	pub client_data: Vec<u32>,
}

/// Everything resolved about one dataset.
#[derive(Clone, PartialEq, Debug)]
pub struct DatasetMeta {
	pub datatype: Datatype,
	pub dataspace: Dataspace,
	pub layout: Layout,
	pub filters: Vec<Filter>,
	pub fill: Option<Vec<u8>>,
}

impl DatasetMeta {
	/// Errors when the filter pipeline names a filter the reader cannot apply.
	pub fn check_filters(&self) -> anyhow::Result<()> {
		for filter in &self.filters {
			if let FilterKind::Unsupported(id) = filter.kind {
				return Err(failure(FailureKind::UnsupportedFilter, format!("filter id {id} is not supported")));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use beamline_core::failure::failure_kind_of;

	#[test]
	fn dataspace_shapes() {
		let scalar = Dataspace { rank: 0, dims: [0, 0] };
		assert_eq!(scalar.num_rows(), 1);
		assert_eq!(scalar.num_cols(), 1);

		let vector = Dataspace { rank: 1, dims: [100, 0] };
		assert_eq!(vector.num_rows(), 100);
		assert_eq!(vector.num_cols(), 1);

		let table = Dataspace { rank: 2, dims: [50, 3] };
		assert_eq!(table.num_elements(), 150);
	}

	#[test]
	fn filter_ids() {
		assert_eq!(FilterKind::from_id(1), FilterKind::Deflate);
		assert_eq!(FilterKind::from_id(2), FilterKind::Shuffle);
		assert_eq!(FilterKind::from_id(3), FilterKind::Fletcher32);
		assert_eq!(FilterKind::from_id(4), FilterKind::Unsupported(4));
	}

	#[test]
	fn unsupported_filter_is_flagged_on_check() {
		let meta = DatasetMeta {
			datatype: Datatype {
				class: DatatypeClass::FixedPoint,
				size: 4,
				signed: true,
				big_endian: false,
			},
			dataspace: Dataspace { rank: 1, dims: [10, 0] },
			layout: Layout::Contiguous { address: 0, size: 40 },
			filters: vec![Filter {
				kind: FilterKind::Unsupported(4),
				client_data: vec![],
			}],
			fill: None,
		};
		let err = meta.check_filters().unwrap_err();
		assert_eq!(failure_kind_of(&err), Some(FailureKind::UnsupportedFilter));
	}
}
