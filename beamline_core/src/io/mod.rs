//! Ranged data readers for granules and index files.
//!
//! Granules live in object storage, on disk, or in memory for tests; every
//! backend exposes the same [`DataReaderTrait`] with ranged reads. The rest of
//! the pipeline runs on plain OS threads, so this module also owns the small
//! tokio runtime the HTTP backend needs and a [`block_on`] bridge into it.

mod data_reader;
mod data_reader_blob;
mod data_reader_file;
mod data_reader_http;
mod runtime;

pub use data_reader::*;
pub use data_reader_blob::*;
pub use data_reader_file::*;
pub use data_reader_http::*;
pub use runtime::*;
