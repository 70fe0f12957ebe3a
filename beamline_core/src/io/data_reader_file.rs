//! This module provides functionality for reading granules stored on a local
//! filesystem.

use super::DataReaderTrait;
use crate::types::{Blob, ByteRange};
use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use std::{
	fs::File,
	io::{Read, Seek, SeekFrom},
	path::Path,
};

/// A struct that provides reading capabilities from a file.
#[derive(Debug)]
pub struct DataReaderFile {
	name: String,
	file: File,
	size: u64,
}

impl DataReaderFile {
	/// Opens a file and creates a `DataReaderFile` instance.
	pub fn open(path: &Path) -> Result<Box<DataReaderFile>> {
		ensure!(path.exists(), "file {path:?} does not exist");
		ensure!(path.is_file(), "path {path:?} must be a file");

		let path = path.canonicalize()?;
		let file = File::open(&path)?;
		let size = file.metadata()?.len();

		Ok(Box::new(DataReaderFile {
			name: path.to_string_lossy().into_owned(),
			file,
			size,
		}))
	}

	/// Size of the underlying file in bytes.
	#[must_use]
	pub fn size(&self) -> u64 {
		self.size
	}
}

#[async_trait]
impl DataReaderTrait for DataReaderFile {
	async fn read_range(&self, range: &ByteRange) -> Result<Blob> {
		let mut buffer = vec![0; range.length as usize];
		let mut file = self
			.file
			.try_clone()
			.with_context(|| format!("failed to clone file '{}'", self.name))?;
		file
			.seek(SeekFrom::Start(range.offset))
			.with_context(|| format!("failed to seek to offset {} in file '{}'", range.offset, self.name))?;
		file.read_exact(&mut buffer).with_context(|| {
			format!(
				"failed to read {} bytes at offset {} in file '{}'",
				range.length, range.offset, self.name
			)
		})?;
		Ok(Blob::from(buffer))
	}

	async fn read_all(&self) -> Result<Blob> {
		let mut buffer = vec![0; self.size as usize];
		let mut file = self
			.file
			.try_clone()
			.with_context(|| format!("failed to clone file '{}'", self.name))?;
		file
			.seek(SeekFrom::Start(0))
			.with_context(|| format!("failed to seek to start of file '{}'", self.name))?;
		file
			.read_exact(&mut buffer)
			.with_context(|| format!("failed to read all {} bytes from file '{}'", self.size, self.name))?;
		Ok(Blob::from(buffer))
	}

	async fn get_size(&self) -> Result<u64> {
		Ok(self.size)
	}

	fn get_name(&self) -> &str {
		&self.name
	}
}
