//! The reader thread pool of the sampler bank.
//!
//! Workers are plain OS threads, each owning its own mutex and pair of
//! condition variables. The coordinator assigns one cache entry per worker,
//! wakes exactly the workers it loaded, and then waits for exactly that set
//! to report back; a worker that misses the timeout simply leaves its entry
//! without a sample. The pool grows lazily per request and never shrinks.

use super::sample::RasterSample;
use super::tile_cache::{CacheEntry, TileRole};
use beamline_core::config::{RequestConfig, SamplingAlgo};
use beamline_core::types::GeoPoint;
use anyhow::Result;
use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Hard bound on reader threads.
pub const MAX_READER_THREADS: usize = 200;

/// How long a worker sleeps between wake-up checks.
const WORKER_POLL: Duration = Duration::from_millis(1000);

/// One sampling assignment.
#[derive(Clone)]
pub struct ReaderTask {
	pub entry: Arc<CacheEntry>,
	pub point: GeoPoint,
	/// Group acquisition time carried into the sample.
	pub gps_time: f64,
	pub config: Arc<RequestConfig>,
}

struct SlotState {
	task: Option<ReaderTask>,
}

struct ReaderSlot {
	state: Mutex<SlotState>,
	wake: Condvar,
	done: Condvar,
}

impl ReaderSlot {
	fn new() -> Arc<ReaderSlot> {
		Arc::new(ReaderSlot {
			state: Mutex::new(SlotState { task: None }),
			wake: Condvar::new(),
			done: Condvar::new(),
		})
	}
}

fn sample_task(task: &ReaderTask) -> Result<Option<RasterSample>> {
	let raster = task.entry.raster()?;
	match task.entry.role() {
		TileRole::Flags => {
			// flags rasters are categorical: nearest only
			let value = raster.sample_nearest(&task.point)?;
			Ok(value.map(|v| {
				let mut sample = RasterSample::new(v, task.gps_time);
				sample.flags = v as u32;
				sample
			}))
		}
		TileRole::Value => {
			if task.config.zonal_stats {
				let sampled = raster.sample_zonal(&task.point, task.config.sampling_radius)?;
				Ok(sampled.map(|(value, stats)| {
					let mut sample = RasterSample::new(value, task.gps_time);
					sample.zonal = Some(stats);
					sample
				}))
			} else if task.config.sampling_algo == SamplingAlgo::Nearest {
				let value = raster.sample_nearest(&task.point)?;
				Ok(value.map(|v| RasterSample::new(v, task.gps_time)))
			} else {
				let value = raster.sample_resampled(&task.point, task.config.sampling_algo, task.config.sampling_radius)?;
				Ok(value.map(|v| RasterSample::new(v, task.gps_time)))
			}
		}
	}
}

fn worker_loop(slot: &ReaderSlot) {
	loop {
		let task = {
			let mut state = slot.state.lock();
			loop {
				if let Some(task) = state.task.clone() {
					break task;
				}
				slot.wake.wait_for(&mut state, WORKER_POLL);
			}
		};

		match sample_task(&task) {
			Ok(Some(sample)) => task.entry.store_sample(sample),
			Ok(None) => {} // point outside the tile or nodata: no sample
			Err(error) => {
				warn!("sampling '{}' failed: {error:#}", task.entry.url());
				task.entry.store_error(error);
			}
		}

		let mut state = slot.state.lock();
		state.task = None;
		slot.done.notify_all();
	}
}

/// The lazily grown pool.
#[derive(Default)]
pub struct ReaderPool {
	slots: Mutex<Vec<Arc<ReaderSlot>>>,
	/// One sampling round at a time; slots are assigned positionally.
	dispatch_lock: Mutex<()>,
}

lazy_static! {
	static ref READER_POOL: ReaderPool = ReaderPool::default();
}

/// The process-wide pool instance.
#[must_use]
pub fn reader_pool() -> &'static ReaderPool {
	&READER_POOL
}

impl ReaderPool {
	/// Grows the pool to `needed` workers (bounded) and returns the slots to
	/// use this round.
	fn ensure_slots(&self, needed: usize) -> Vec<Arc<ReaderSlot>> {
		let needed = needed.min(MAX_READER_THREADS);
		let mut slots = self.slots.lock();
		while slots.len() < needed {
			let slot = ReaderSlot::new();
			let worker = slot.clone();
			std::thread::Builder::new()
				.name(format!("tile-reader-{}", slots.len()))
				.spawn(move || worker_loop(&worker))
				.expect("failed to spawn a tile reader");
			slots.push(slot);
		}
		debug!("reader pool at {} workers", slots.len());
		slots[..needed].to_vec()
	}

	/// Current pool size.
	#[must_use]
	pub fn len(&self) -> usize {
		self.slots.lock().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Dispatches every task and waits for the signalled set. Tasks beyond
	/// the pool bound run in waves. Returns the number of workers that
	/// reported back within `timeout`.
	pub fn dispatch_and_wait(&self, tasks: &[ReaderTask], timeout: Duration) -> usize {
		let _round = self.dispatch_lock.lock();
		let mut completed = 0;
		for wave in tasks.chunks(MAX_READER_THREADS.max(1)) {
			let slots = self.ensure_slots(wave.len());

			for (slot, task) in slots.iter().zip(wave) {
				let mut state = slot.state.lock();
				state.task = Some(task.clone());
				slot.wake.notify_one();
			}

			for slot in &slots {
				let mut state = slot.state.lock();
				while state.task.is_some() {
					if slot.done.wait_for(&mut state, timeout).timed_out() {
						break;
					}
				}
				if state.task.is_none() {
					completed += 1;
				}
			}
		}
		completed
	}
}
