//! Process-wide repository of resolved dataset metadata.
//!
//! Header walks are expensive against object storage; once a `(granule,
//! path)` pair has been resolved, every later open of the same dataset skips
//! straight to its slab reads. The repository only ever grows; entries are
//! tiny compared to the reads they save.

use super::metadata::DatasetMeta;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

lazy_static! {
	static ref META_REPO: Mutex<HashMap<String, Arc<DatasetMeta>>> = Mutex::new(HashMap::new());
}

fn repo_key(granule: &str, path: &str) -> String {
	format!("{granule}|{path}")
}

/// Looks up resolved metadata, or resolves it with `resolve` and stores the
/// result. Concurrent first-touch is safe; the first resolution wins.
pub(crate) fn get_or_resolve<F>(granule: &str, path: &str, resolve: F) -> anyhow::Result<Arc<DatasetMeta>>
where
	F: FnOnce() -> anyhow::Result<DatasetMeta>,
{
	let key = repo_key(granule, path);
	if let Some(meta) = META_REPO.lock().get(&key) {
		return Ok(meta.clone());
	}
	// resolution happens outside the lock; it does remote I/O
	let resolved = Arc::new(resolve()?);
	let mut repo = META_REPO.lock();
	Ok(repo.entry(key).or_insert(resolved).clone())
}

/// Entries currently resolved, for diagnostics.
#[must_use]
pub fn resolved_count() -> usize {
	META_REPO.lock().len()
}
