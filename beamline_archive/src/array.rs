//! The lazy array handle: one pending background read of one named array.
//!
//! Constructing a handle schedules exactly one read against the archive;
//! `join` blocks (with a timeout) until that read completes or fails. Handles
//! are one-shot: once joined, the read is never reissued. After a successful
//! join the result is available as a typed array that can be trimmed in place
//! and serialized into record tails.

use super::array_data::ArrayData;
use super::datatype::ElementType;
use super::reader::Archive;
use beamline_core::failure::{FailureKind, failure_kind_of};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a [`ArrayHandle::join`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum JoinStatus {
	Ok,
	Timeout,
	Error,
}

struct Shared {
	result: Mutex<Option<Result<ArrayData>>>,
	done: Condvar,
}

/// One pending read of `(path, column, first_row, num_rows)`.
pub struct ArrayHandle {
	shared: Arc<Shared>,
	path: String,
	data: Option<ArrayData>,
	error: Option<(Option<FailureKind>, String)>,
}

impl ArrayHandle {
	/// Schedules the background read immediately.
	#[must_use]
	pub fn new(archive: Arc<Archive>, path: &str, col: u64, first_row: u64, num_rows: i64) -> ArrayHandle {
		let shared = Arc::new(Shared {
			result: Mutex::new(None),
			done: Condvar::new(),
		});

		let worker_shared = shared.clone();
		let worker_path = path.to_string();
		std::thread::Builder::new()
			.name("array-read".to_string())
			.spawn(move || {
				let outcome = archive.read_array(&worker_path, col, first_row, num_rows);
				*worker_shared.result.lock() = Some(outcome);
				worker_shared.done.notify_all();
			})
			.expect("failed to spawn an array read thread");

		ArrayHandle {
			shared,
			path: path.to_string(),
			data: None,
			error: None,
		}
	}

	/// Waits for the read. A timeout leaves the read pending and may be
	/// retried; a completed join is final.
	pub fn join(&mut self, timeout: Duration) -> JoinStatus {
		if self.data.is_some() {
			return JoinStatus::Ok;
		}
		if self.error.is_some() {
			return JoinStatus::Error;
		}

		let mut result = self.shared.result.lock();
		if result.is_none() && self.shared.done.wait_for(&mut result, timeout).timed_out() && result.is_none() {
			return JoinStatus::Timeout;
		}
		match result.take() {
			Some(Ok(data)) => {
				self.data = Some(data);
				JoinStatus::Ok
			}
			Some(Err(error)) => {
				self.error = Some((failure_kind_of(&error), format!("{error:#}")));
				JoinStatus::Error
			}
			None => JoinStatus::Timeout,
		}
	}

	/// The dataset path this handle reads.
	#[must_use]
	pub fn path(&self) -> &str {
		&self.path
	}

	/// The failure kind and message, after an errored join.
	#[must_use]
	pub fn error(&self) -> Option<(Option<FailureKind>, &str)> {
		self.error.as_ref().map(|(kind, text)| (*kind, text.as_str()))
	}

	/// The typed result. Meaningful only after a successful join.
	#[must_use]
	pub fn data(&self) -> Option<&ArrayData> {
		self.data.as_ref()
	}

	/// Elements available, 0 before a successful join.
	#[must_use]
	pub fn len(&self) -> usize {
		self.data.as_ref().map_or(0, ArrayData::len)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[must_use]
	pub fn element_type(&self) -> Option<ElementType> {
		self.data.as_ref().map(ArrayData::element_type)
	}

	/// Discards the first `k` elements in place.
	pub fn trim(&mut self, k: usize) {
		if let Some(data) = self.data.as_mut() {
			data.trim(k);
		}
	}

	pub fn value_f64(&self, index: usize) -> Result<f64> {
		match &self.data {
			Some(data) => data.value_f64(index),
			None => anyhow::bail!("handle for '{}' not joined", self.path),
		}
	}

	pub fn value_i64(&self, index: usize) -> Result<i64> {
		match &self.data {
			Some(data) => data.value_i64(index),
			None => anyhow::bail!("handle for '{}' not joined", self.path),
		}
	}

	/// Copies raw element bytes into `dst` for record embedding.
	pub fn serialize(&self, dst: &mut [u8], row: usize, count: usize) -> Result<usize> {
		match &self.data {
			Some(data) => data.serialize(dst, row, count),
			None => anyhow::bail!("handle for '{}' not joined", self.path),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	// Handle mechanics against a real archive are exercised in the subsetter
	// tests; here the join state machine is verified in isolation.

	fn handle_with_shared() -> (ArrayHandle, Arc<Shared>) {
		let shared = Arc::new(Shared {
			result: Mutex::new(None),
			done: Condvar::new(),
		});
		(
			ArrayHandle {
				shared: shared.clone(),
				path: "/test/column".to_string(),
				data: None,
				error: None,
			},
			shared,
		)
	}

	#[test]
	fn join_times_out_while_pending() {
		let (mut handle, _shared) = handle_with_shared();
		assert_eq!(handle.join(Duration::from_millis(10)), JoinStatus::Timeout);
		// a timed-out join may be retried
		assert_eq!(handle.join(Duration::from_millis(10)), JoinStatus::Timeout);
	}

	#[test]
	fn join_returns_ok_and_is_final() {
		let (mut handle, shared) = handle_with_shared();
		let data = ArrayData::new(ElementType::Float64, 8, 7.5f64.to_ne_bytes().to_vec());
		*shared.result.lock() = Some(Ok(data));
		shared.done.notify_all();

		assert_eq!(handle.join(Duration::from_millis(100)), JoinStatus::Ok);
		assert_eq!(handle.len(), 1);
		assert_eq!(handle.value_f64(0).unwrap(), 7.5);
		assert_eq!(handle.element_type(), Some(ElementType::Float64));
		// joined handles stay joined
		assert_eq!(handle.join(Duration::from_millis(1)), JoinStatus::Ok);
	}

	#[test]
	fn join_surfaces_errors_with_their_kind() {
		use beamline_core::failure::failure;

		let (mut handle, shared) = handle_with_shared();
		*shared.result.lock() = Some(Err(failure(FailureKind::ResourceMissing, "no such dataset")));
		shared.done.notify_all();

		assert_eq!(handle.join(Duration::from_millis(100)), JoinStatus::Error);
		let (kind, text) = handle.error().unwrap();
		assert_eq!(kind, Some(FailureKind::ResourceMissing));
		assert!(text.contains("no such dataset"));
		assert_eq!(handle.join(Duration::from_millis(1)), JoinStatus::Error);
	}

	#[test]
	fn unjoined_access_is_an_error() {
		let (handle, _shared) = handle_with_shared();
		assert!(handle.value_f64(0).is_err());
		assert_eq!(handle.len(), 0);
		assert!(handle.data().is_none());
	}
}
