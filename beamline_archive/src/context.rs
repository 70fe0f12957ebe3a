//! Per-granule I/O context.
//!
//! A context owns the block cache shared by every dataset read of one granule
//! within one request. Opens of the same granule pass the same context; a
//! caller that passes none gets a fresh, short-lived context instead.

use super::block_cache::BlockCache;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared I/O state for one granule within one request.
#[derive(Default)]
pub struct GranuleContext {
	cache: Mutex<Option<Arc<BlockCache>>>,
}

impl GranuleContext {
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// The context's block cache, created on first use. The source size is
	/// fixed by whichever open reaches the context first; one context never
	/// spans two different granules.
	pub(crate) fn block_cache(&self, source_size: u64) -> Arc<BlockCache> {
		let mut cache = self.cache.lock();
		match cache.as_ref() {
			Some(existing) => existing.clone(),
			None => {
				let created = Arc::new(BlockCache::new(source_size));
				*cache = Some(created.clone());
				created
			}
		}
	}
}
