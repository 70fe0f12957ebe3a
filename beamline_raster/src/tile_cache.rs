//! The process-wide cache of open raster tiles.
//!
//! Entries are keyed by tile URL and carry the open handle, the owning group,
//! an enabled flag and a use timestamp. Eviction is group-atomic: when the
//! cache is over its limit, the oldest disabled entry is found and its whole
//! group of disabled entries leaves together; enabled entries never leave.

use super::gdal_tile::GdalRaster;
use super::sample::RasterSample;
use anyhow::Result;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Open tiles kept across requests.
pub const MAX_CACHED_TILES: usize = 20;

/// What a cache entry's raster contributes to a sample.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TileRole {
	Value,
	Flags,
}

struct EntryState {
	enabled: bool,
	last_use: Instant,
	sample: Option<RasterSample>,
	error: Option<anyhow::Error>,
}

/// One cached tile.
pub struct CacheEntry {
	url: String,
	group_id: String,
	role: TileRole,
	raster: Mutex<Option<Arc<GdalRaster>>>,
	state: Mutex<EntryState>,
}

impl CacheEntry {
	fn new(url: &str, group_id: &str, role: TileRole) -> Arc<CacheEntry> {
		Arc::new(CacheEntry {
			url: url.to_string(),
			group_id: group_id.to_string(),
			role,
			raster: Mutex::new(None),
			state: Mutex::new(EntryState {
				enabled: true,
				last_use: Instant::now(),
				sample: None,
				error: None,
			}),
		})
	}

	#[must_use]
	pub fn url(&self) -> &str {
		&self.url
	}

	#[must_use]
	pub fn group_id(&self) -> &str {
		&self.group_id
	}

	#[must_use]
	pub fn role(&self) -> TileRole {
		self.role
	}

	/// The open raster handle, opened on first use.
	pub fn raster(&self) -> Result<Arc<GdalRaster>> {
		let mut raster = self.raster.lock();
		if let Some(open) = raster.as_ref() {
			return Ok(open.clone());
		}
		let opened = Arc::new(GdalRaster::open(&self.url)?);
		*raster = Some(opened.clone());
		Ok(opened)
	}

	#[must_use]
	pub fn is_enabled(&self) -> bool {
		self.state.lock().enabled
	}

	fn enable(&self) {
		let mut state = self.state.lock();
		state.enabled = true;
		state.last_use = Instant::now();
		state.sample = None;
		state.error = None;
	}

	fn disable(&self) {
		self.state.lock().enabled = false;
	}

	fn age(&self) -> std::time::Duration {
		self.state.lock().last_use.elapsed()
	}

	/// Workers store their result here, under the entry's own lock; the
	/// coordinator merges after all joins.
	pub fn store_sample(&self, sample: RasterSample) {
		self.state.lock().sample = Some(sample);
	}

	pub fn store_error(&self, error: anyhow::Error) {
		self.state.lock().error = Some(error);
	}

	pub fn take_sample(&self) -> Option<RasterSample> {
		self.state.lock().sample.take()
	}

	pub fn take_error(&self) -> Option<anyhow::Error> {
		self.state.lock().error.take()
	}
}

/// The URL-keyed cache.
#[derive(Default)]
pub struct TileCache {
	entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

lazy_static! {
	static ref TILE_CACHE: TileCache = TileCache::default();
}

/// The process-wide cache instance.
#[must_use]
pub fn tile_cache() -> &'static TileCache {
	&TILE_CACHE
}

impl TileCache {
	/// Marks every entry disabled; a sampling request then re-enables exactly
	/// the entries it needs.
	pub fn disable_all(&self) {
		for entry in self.entries.lock().values() {
			entry.disable();
		}
	}

	/// Returns the entry for `url`, creating it when absent, enabled and
	/// timestamped either way.
	pub fn enable_or_insert(&self, url: &str, group_id: &str, role: TileRole) -> Arc<CacheEntry> {
		let mut entries = self.entries.lock();
		let entry = entries
			.entry(url.to_string())
			.or_insert_with(|| CacheEntry::new(url, group_id, role))
			.clone();
		drop(entries);
		entry.enable();
		entry
	}

	/// Evicts oldest disabled groups until the cache is back under its limit
	/// or only enabled entries remain.
	pub fn evict_over_limit(&self) {
		let mut entries = self.entries.lock();
		while entries.len() > MAX_CACHED_TILES {
			let oldest = entries
				.values()
				.filter(|e| !e.is_enabled())
				.max_by_key(|e| e.age())
				.map(|e| e.group_id.clone());
			let Some(group_id) = oldest else {
				break; // nothing disabled is left to evict
			};
			entries.retain(|_, e| e.is_enabled() || e.group_id != group_id);
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Drops every entry. Test support.
	pub fn clear(&self) {
		self.entries.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// Entries are created without opening rasters, so cache mechanics are
	// testable without any datasets on disk.

	#[test]
	fn insert_enable_disable_cycle() {
		let cache = TileCache::default();
		let entry = cache.enable_or_insert("a.tif", "g1", TileRole::Value);
		assert!(entry.is_enabled());
		cache.disable_all();
		assert!(!entry.is_enabled());
		let again = cache.enable_or_insert("a.tif", "g1", TileRole::Value);
		assert!(Arc::ptr_eq(&entry, &again));
		assert!(entry.is_enabled());
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn eviction_is_group_atomic_and_spares_enabled() {
		let cache = TileCache::default();
		for index in 0..MAX_CACHED_TILES {
			cache.enable_or_insert(&format!("old_{index}.tif"), &format!("g{}", index / 2), TileRole::Value);
			std::thread::sleep(std::time::Duration::from_millis(2));
		}
		cache.disable_all();

		// two fresh enabled entries push the cache over its limit
		cache.enable_or_insert("fresh_a.tif", "fresh", TileRole::Value);
		cache.enable_or_insert("fresh_b.tif", "fresh", TileRole::Flags);
		assert_eq!(cache.len(), MAX_CACHED_TILES + 2);

		cache.evict_over_limit();
		assert!(cache.len() <= MAX_CACHED_TILES);
		// the fresh group is untouched
		let survivors = cache.enable_or_insert("fresh_a.tif", "fresh", TileRole::Value);
		assert_eq!(survivors.group_id(), "fresh");
		// the oldest group left as a unit: g0 held old_0 and old_1
		let entries = cache.entries.lock();
		assert!(!entries.contains_key("old_0.tif"));
		assert!(!entries.contains_key("old_1.tif"));
	}

	#[test]
	fn eviction_stops_when_everything_is_enabled() {
		let cache = TileCache::default();
		for index in 0..(MAX_CACHED_TILES + 4) {
			cache.enable_or_insert(&format!("t{index}.tif"), "g", TileRole::Value);
		}
		cache.evict_over_limit();
		// every entry is enabled, so nothing can leave
		assert_eq!(cache.len(), MAX_CACHED_TILES + 4);
	}

	#[test]
	fn sample_slots_are_per_entry() {
		let cache = TileCache::default();
		let entry = cache.enable_or_insert("s.tif", "g", TileRole::Value);
		entry.store_sample(RasterSample::new(5.5, 123.0));
		let sample = entry.take_sample().unwrap();
		assert_eq!(sample.value, 5.5);
		assert!(entry.take_sample().is_none());
	}

	#[test]
	fn reenabling_clears_stale_results() {
		let cache = TileCache::default();
		let entry = cache.enable_or_insert("r.tif", "g", TileRole::Value);
		entry.store_sample(RasterSample::new(1.0, 0.0));
		cache.disable_all();
		cache.enable_or_insert("r.tif", "g", TileRole::Value);
		assert!(entry.take_sample().is_none());
	}
}
