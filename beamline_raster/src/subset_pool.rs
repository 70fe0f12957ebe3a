//! The global byte pool bounding windowed subset reads.
//!
//! Every windowed read reserves its bytes here first. A reservation that does
//! not fit fails that one subset; sampling continues and the tile simply
//! yields no sample. Reservations return their bytes on drop.

use beamline_core::failure::{FailureKind, failure};
use anyhow::Result;
use lazy_static::lazy_static;
use parking_lot::Mutex;

/// Hard cap on outstanding subset bytes: 6 GiB.
pub const MAX_SUBSET_BYTES: u64 = 6 * 0x4000_0000;

lazy_static! {
	static ref POOL_USED: Mutex<u64> = Mutex::new(0);
}

/// Bytes currently reserved, for diagnostics.
#[must_use]
pub fn subset_pool_used() -> u64 {
	*POOL_USED.lock()
}

/// An RAII reservation of subset bytes.
pub struct SubsetReservation {
	bytes: u64,
}

impl SubsetReservation {
	/// Reserves `bytes` from the pool, or fails with an out-of-memory kind
	/// without blocking.
	pub fn reserve(bytes: u64) -> Result<SubsetReservation> {
		let mut used = POOL_USED.lock();
		if *used + bytes > MAX_SUBSET_BYTES {
			return Err(failure(
				FailureKind::OutOfMemory,
				format!("subset of {bytes} bytes exceeds the remaining pool ({} in use)", *used),
			));
		}
		*used += bytes;
		Ok(SubsetReservation { bytes })
	}

	#[must_use]
	pub fn bytes(&self) -> u64 {
		self.bytes
	}
}

impl Drop for SubsetReservation {
	fn drop(&mut self) {
		let mut used = POOL_USED.lock();
		*used = used.saturating_sub(self.bytes);
	}
}
