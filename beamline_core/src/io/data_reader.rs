//! This module defines the [`DataReaderTrait`] and the URL-based factory that
//! picks a backend for a granule location.

use super::{DataReaderFile, DataReaderHttp, block_on};
use crate::types::{Blob, ByteRange};
use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Url;
use std::fmt::Debug;
use std::path::Path;

/// Type alias for a boxed dynamic implementation of the `DataReaderTrait`.
pub type DataReader = Box<dyn DataReaderTrait>;

/// A trait for ranged reads from a data source.
#[async_trait]
pub trait DataReaderTrait: Debug + Send + Sync {
	/// Reads a specific range of bytes from the data source.
	async fn read_range(&self, range: &ByteRange) -> Result<Blob>;

	/// Reads all the data from the data source.
	async fn read_all(&self) -> Result<Blob>;

	/// Total size of the data source in bytes.
	async fn get_size(&self) -> Result<u64>;

	/// Gets the name of the data source.
	fn get_name(&self) -> &str;
}

/// Opens a reader for a granule location: `http(s)://…` URLs, `file://…` URLs,
/// or plain filesystem paths.
pub fn open_data_reader(location: &str) -> Result<DataReader> {
	if location.starts_with("http://") || location.starts_with("https://") {
		return Ok(DataReaderHttp::from_url(Url::parse(location)?)?);
	}
	if let Some(path) = location.strip_prefix("file://") {
		return Ok(DataReaderFile::open(Path::new(path))?);
	}
	if location.contains("://") {
		bail!("unsupported scheme in location '{location}'");
	}
	Ok(DataReaderFile::open(Path::new(location))?)
}

/// Synchronous ranged read, for callers on plain worker threads.
pub fn read_range_blocking(reader: &DataReader, range: &ByteRange) -> Result<Blob> {
	block_on(reader.read_range(range))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn factory_rejects_unknown_scheme() {
		assert!(open_data_reader("s3q://bucket/key").is_err());
	}

	#[test]
	fn factory_opens_plain_paths_and_file_urls() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(b"0123456789").unwrap();
		let path = file.path().to_str().unwrap().to_string();

		let plain = open_data_reader(&path).unwrap();
		let blob = read_range_blocking(&plain, &ByteRange::new(2, 3)).unwrap();
		assert_eq!(blob.as_slice(), b"234");

		let url = format!("file://{path}");
		let via_url = open_data_reader(&url).unwrap();
		let blob = read_range_blocking(&via_url, &ByteRange::new(0, 4)).unwrap();
		assert_eq!(blob.as_slice(), b"0123");
	}
}
