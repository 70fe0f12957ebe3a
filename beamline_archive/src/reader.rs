//! The [`Archive`] facade: open a granule by location, read named arrays.

use super::array_data::ArrayData;
use super::chunks::read_slab;
use super::context::GranuleContext;
use super::file::ArchiveFile;
use super::meta_repo;
use super::metadata::DatasetMeta;
use super::object_header::HeaderWalker;
use super::superblock::Superblock;
use beamline_core::io::{DataReader, block_on, open_data_reader};
use anyhow::{Context, Result};
use log::debug;
use std::sync::Arc;

pub use super::chunks::ALL_ROWS;

/// One open granule.
pub struct Archive {
	file: ArchiveFile,
	location: String,
}

impl Archive {
	/// Opens a granule. Reads of the same granule within one request should
	/// share a context so its block cache carries between datasets; passing
	/// `None` creates a fresh, short-lived context.
	pub fn open(location: &str, context: Option<Arc<GranuleContext>>) -> Result<Archive> {
		let reader: DataReader = open_data_reader(location).with_context(|| format!("while opening '{location}'"))?;
		let source_size = block_on(reader.get_size()).with_context(|| format!("while sizing '{location}'"))?;
		let context = context.unwrap_or_else(GranuleContext::new);

		let mut file = ArchiveFile {
			reader,
			cache: context.block_cache(source_size),
			superblock: Superblock::default(),
		};
		file.superblock = Superblock::read(&file).with_context(|| format!("while reading the superblock of '{location}'"))?;
		debug!(
			"opened '{location}': offsets {}B, lengths {}B, root at {:#X}",
			file.superblock.offset_size, file.superblock.length_size, file.superblock.root_group_address
		);

		Ok(Archive {
			file,
			location: location.to_string(),
		})
	}

	/// The location this archive was opened from.
	#[must_use]
	pub fn location(&self) -> &str {
		&self.location
	}

	/// Resolves a dataset path to its metadata, consulting the process-wide
	/// repository first.
	pub fn dataset_meta(&self, path: &str) -> Result<Arc<DatasetMeta>> {
		let components: Vec<String> = path.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect();
		meta_repo::get_or_resolve(&self.location, path, || HeaderWalker::new(&self.file, &components).resolve())
	}

	/// Reads `num_rows` rows of one column of the named dataset.
	/// `num_rows == ALL_ROWS` reads to the end.
	pub fn read_array(&self, path: &str, col: u64, first_row: u64, num_rows: i64) -> Result<ArrayData> {
		let meta = self.dataset_meta(path)?;
		read_slab(&self.file, &meta, col, first_row, num_rows).with_context(|| format!("while reading '{path}'"))
	}
}
