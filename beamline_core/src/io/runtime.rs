//! The I/O runtime bridge.
//!
//! Pipeline workers are plain OS threads; only the HTTP backend is
//! future-based. A single shared runtime drives those futures, and
//! [`block_on`] lets a worker thread wait for one synchronously. Never call
//! [`block_on`] from inside the runtime itself.

use lazy_static::lazy_static;
use std::future::Future;
use tokio::runtime::Runtime;

lazy_static! {
	static ref IO_RUNTIME: Runtime = tokio::runtime::Builder::new_multi_thread()
		.worker_threads((num_cpus::get() / 4).max(2))
		.thread_name("beamline-io")
		.enable_all()
		.build()
		.expect("failed to start the I/O runtime");
}

/// Runs a future to completion on the shared I/O runtime, blocking the
/// calling thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
	IO_RUNTIME.block_on(future)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn block_on_returns_future_output() {
		let value = block_on(async { 21 * 2 });
		assert_eq!(value, 42);
	}

	#[test]
	fn block_on_works_from_many_threads() {
		let handles: Vec<_> = (0..8)
			.map(|i| std::thread::spawn(move || block_on(async move { i * i })))
			.collect();
		for (i, handle) in handles.into_iter().enumerate() {
			assert_eq!(handle.join().unwrap(), i * i);
		}
	}
}
