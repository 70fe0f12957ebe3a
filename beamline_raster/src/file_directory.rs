//! Per-request dense file ids.
//!
//! Samples reference tiles by a small id rather than by URL; the id is
//! assigned the first time a tile contributes a sample within a request, and
//! the trailing file-directory record maps every assigned id back to its URL.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Dense `url -> file_id` dictionary for one request.
#[derive(Default)]
pub struct FileDirectory {
	inner: Mutex<DirectoryInner>,
}

#[derive(Default)]
struct DirectoryInner {
	ids: HashMap<String, u64>,
	order: Vec<String>,
}

impl FileDirectory {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// The id of `url`, assigned densely on first sight. Ids start at 1 so 0
	/// stays "no file".
	pub fn assign(&self, url: &str) -> u64 {
		let mut inner = self.inner.lock();
		if let Some(id) = inner.ids.get(url) {
			return *id;
		}
		let id = inner.order.len() as u64 + 1;
		inner.ids.insert(url.to_string(), id);
		inner.order.push(url.to_string());
		id
	}

	/// Every assignment in id order, `(file_id, url)`.
	#[must_use]
	pub fn snapshot(&self) -> Vec<(u64, String)> {
		let inner = self.inner.lock();
		inner
			.order
			.iter()
			.enumerate()
			.map(|(index, url)| (index as u64 + 1, url.clone()))
			.collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.lock().order.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
