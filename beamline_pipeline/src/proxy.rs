//! The fan-out proxy: one multi-granule request distributed across worker
//! nodes registered with an external orchestrator.
//!
//! The proxy holds one slot per requested resource. A shared pool of
//! dispatch threads (sized by CPU load factor) drains the slots: lock a node
//! through the orchestrator, run the sub-request against it, pipe its records
//! into the output queue unchanged, unlock. A failed slot surfaces as an
//! exception record and never aborts its siblings; the proxy completes when
//! every slot does, then posts the stream terminator.

use super::records::{pack_exception, register_pipeline_records};
use beamline_core::failure::{Failure, FailureKind, failure, failure_kind_of};
use beamline_core::io::block_on;
use beamline_core::msgq::Publisher;
use beamline_core::types::Blob;
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on the request parameter blob: 32 MiB.
pub const MAX_PARAMETER_SIZE: usize = 0x0200_0000;
/// Concurrent sub-requests per CPU core.
pub const CPU_LOAD_FACTOR: usize = 10;
/// Default node lock timeout: ten minutes.
pub const NODE_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

const POST_TIMEOUT: Duration = Duration::from_millis(1000);
const POST_ATTEMPTS: usize = 600;

/// The lock/unlock surface of the external orchestrator.
pub trait Orchestrator: Send + Sync {
	/// Locks a worker node for `resource`, returning the node URL.
	fn lock(&self, resource: &str, timeout: Duration) -> Result<String>;
	/// Releases a previously granted node.
	fn unlock(&self, node_url: &str) -> Result<()>;
}

/// REST orchestrator client speaking the lock/unlock protocol over HTTPS.
pub struct HttpOrchestrator {
	base_url: String,
	client: reqwest::Client,
}

#[derive(Deserialize)]
struct LockGrant {
	node: String,
}

impl HttpOrchestrator {
	pub fn new(base_url: &str) -> Result<HttpOrchestrator> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(630))
			.build()
			.context("while building the orchestrator client")?;
		Ok(HttpOrchestrator {
			base_url: base_url.trim_end_matches('/').to_string(),
			client,
		})
	}
}

impl Orchestrator for HttpOrchestrator {
	fn lock(&self, resource: &str, timeout: Duration) -> Result<String> {
		let url = format!("{}/lock", self.base_url);
		let body = serde_json::json!({
			"resource": resource,
			"timeout": timeout.as_secs(),
		});
		let response = block_on(self.client.post(&url).json(&body).send())
			.map_err(|e| failure(FailureKind::OrchestratorUnavailable, format!("lock request failed: {e}")))?;
		if !response.status().is_success() {
			return Err(failure(
				FailureKind::NodeLockFailed,
				format!("orchestrator refused the lock for '{resource}': {}", response.status()),
			));
		}
		let grant: LockGrant = block_on(response.json())
			.map_err(|e| failure(FailureKind::OrchestratorUnavailable, format!("bad lock grant: {e}")))?;
		Ok(grant.node)
	}

	fn unlock(&self, node_url: &str) -> Result<()> {
		let url = format!("{}/unlock", self.base_url);
		let body = serde_json::json!({ "node": node_url });
		let response = block_on(self.client.post(&url).json(&body).send())
			.map_err(|e| failure(FailureKind::OrchestratorUnavailable, format!("unlock request failed: {e}")))?;
		if !response.status().is_success() {
			return Err(failure(
				FailureKind::OrchestratorUnavailable,
				format!("unlock of '{node_url}' refused: {}", response.status()),
			));
		}
		Ok(())
	}
}

/// Issues one sub-request against a locked node and returns its records.
pub trait NodeClient: Send + Sync {
	fn run(&self, node_url: &str, resource: &str, parameters: &str) -> Result<Vec<Blob>>;
}

/// HTTP node client: posts the sub-request and splits the response into
/// length-prefixed record frames. A zero-length frame ends the stream.
pub struct HttpNodeClient {
	client: reqwest::Client,
}

impl HttpNodeClient {
	pub fn new() -> Result<HttpNodeClient> {
		Ok(HttpNodeClient {
			client: reqwest::Client::builder()
				.timeout(Duration::from_secs(3600))
				.build()
				.context("while building the node client")?,
		})
	}

	fn split_frames(bytes: &[u8]) -> Result<Vec<Blob>> {
		let mut records = Vec::new();
		let mut at = 0usize;
		while at + 4 <= bytes.len() {
			let length = u32::from_le_bytes(bytes[at..at + 4].try_into()?) as usize;
			at += 4;
			if length == 0 {
				break; // sub-request terminator; the proxy posts its own
			}
			if at + length > bytes.len() {
				anyhow::bail!("truncated record frame at byte {at}");
			}
			records.push(Blob::from(&bytes[at..at + length]));
			at += length;
		}
		Ok(records)
	}
}

impl NodeClient for HttpNodeClient {
	fn run(&self, node_url: &str, resource: &str, parameters: &str) -> Result<Vec<Blob>> {
		let url = format!("{}/subset", node_url.trim_end_matches('/'));
		let body = serde_json::json!({
			"resource": resource,
			"parameters": parameters,
		});
		let response = block_on(self.client.post(&url).json(&body).send())
			.with_context(|| format!("while issuing the sub-request to '{node_url}'"))?;
		if !response.status().is_success() {
			anyhow::bail!("node '{node_url}' answered {}", response.status());
		}
		let bytes = block_on(response.bytes()).context("while reading the sub-request response")?;
		Self::split_frames(&bytes)
	}
}

struct SlotTable {
	remaining: Mutex<usize>,
	done: Condvar,
}

type ProxyTask = Box<dyn FnOnce() + Send>;

/// The shared dispatch pool, grown lazily to `CPU_LOAD_FACTOR x cores`.
#[derive(Default)]
struct ProxyPool {
	queue: Mutex<VecDeque<ProxyTask>>,
	available: Condvar,
	workers: Mutex<usize>,
}

lazy_static! {
	static ref PROXY_POOL: ProxyPool = ProxyPool::default();
}

impl ProxyPool {
	fn capacity() -> usize {
		CPU_LOAD_FACTOR * num_cpus::get()
	}

	fn submit(&'static self, task: ProxyTask) {
		{
			let mut queue = self.queue.lock();
			queue.push_back(task);
			self.available.notify_one();
		}
		let mut workers = self.workers.lock();
		let queued = self.queue.lock().len();
		if *workers < Self::capacity() && queued > 0 {
			*workers += 1;
			let index = *workers;
			std::thread::Builder::new()
				.name(format!("proxy-dispatch-{index}"))
				.spawn(move || {
					loop {
						let task = {
							let mut queue = self.queue.lock();
							loop {
								if let Some(task) = queue.pop_front() {
									break task;
								}
								self.available.wait_for(&mut queue, Duration::from_millis(1000));
							}
						};
						task();
					}
				})
				.expect("failed to spawn a proxy dispatch thread");
		}
	}
}

/// One fan-out request.
pub struct ProxyRequest {
	pub resources: Vec<String>,
	/// JSON parameter blob forwarded verbatim to every node.
	pub parameters: String,
	pub output_queue: String,
	pub orchestrator: Arc<dyn Orchestrator>,
	pub node_client: Arc<dyn NodeClient>,
	pub active: Arc<AtomicBool>,
	pub lock_timeout: Duration,
}

/// Counters of one proxy run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProxyStats {
	pub slots: u32,
	pub records_piped: u32,
	pub slot_failures: u32,
}

pub struct FanoutProxy;

impl FanoutProxy {
	/// Distributes the request and blocks until every slot completes, then
	/// posts the terminator.
	pub fn run(request: &ProxyRequest) -> Result<ProxyStats> {
		register_pipeline_records();
		if request.parameters.len() > MAX_PARAMETER_SIZE {
			return Err(failure(
				FailureKind::UndersizedBuffer,
				format!("parameter blob of {} bytes exceeds the {MAX_PARAMETER_SIZE} bound", request.parameters.len()),
			));
		}

		let publisher = Arc::new(Publisher::new(&request.output_queue));
		let slots = Arc::new(SlotTable {
			remaining: Mutex::new(request.resources.len()),
			done: Condvar::new(),
		});
		let stats = Arc::new(Mutex::new(ProxyStats {
			slots: request.resources.len() as u32,
			..ProxyStats::default()
		}));

		info!("fanning '{}' out across {} resources", request.output_queue, request.resources.len());
		for resource in &request.resources {
			let slot = SlotWork {
				resource: resource.clone(),
				parameters: request.parameters.clone(),
				orchestrator: request.orchestrator.clone(),
				node_client: request.node_client.clone(),
				publisher: publisher.clone(),
				active: request.active.clone(),
				lock_timeout: request.lock_timeout,
				slots: slots.clone(),
				stats: stats.clone(),
			};
			PROXY_POOL.submit(Box::new(move || slot.run()));
		}

		// wait for every slot; timed waits keep cancellation observable
		{
			let mut remaining = slots.remaining.lock();
			while *remaining > 0 {
				slots.done.wait_for(&mut remaining, Duration::from_millis(1000));
			}
		}

		if let Err(error) = publisher.post_terminator(Duration::from_secs(60)) {
			warn!("terminator post failed on '{}': {error:#}", request.output_queue);
		}
		let totals = *stats.lock();
		info!(
			"fan-out on '{}' complete: {} records piped, {} slot failures",
			request.output_queue, totals.records_piped, totals.slot_failures
		);
		Ok(totals)
	}
}

struct SlotWork {
	resource: String,
	parameters: String,
	orchestrator: Arc<dyn Orchestrator>,
	node_client: Arc<dyn NodeClient>,
	publisher: Arc<Publisher>,
	active: Arc<AtomicBool>,
	lock_timeout: Duration,
	slots: Arc<SlotTable>,
	stats: Arc<Mutex<ProxyStats>>,
}

impl SlotWork {
	fn run(self) {
		let outcome = self.process();
		if let Err(error) = &outcome {
			warn!("slot '{}' failed: {error:#}", self.resource);
			let kind = failure_kind_of(error).unwrap_or(FailureKind::NodeLockFailed);
			if let Ok(record) = pack_exception(kind, 3, &format!("'{}': {error:#}", self.resource)) {
				self.post_with_retry(Blob::from(record.serialize()));
			}
			self.stats.lock().slot_failures += 1;
		}

		let mut remaining = self.slots.remaining.lock();
		*remaining -= 1;
		self.slots.done.notify_all();
	}

	fn process(&self) -> Result<()> {
		if !self.active.load(Ordering::Acquire) {
			return Err(anyhow::Error::new(Failure::new(FailureKind::Empty, "request cancelled")));
		}

		let node = self
			.orchestrator
			.lock(&self.resource, self.lock_timeout)
			.with_context(|| format!("while locking a node for '{}'", self.resource))?;
		debug!("slot '{}' granted node '{node}'", self.resource);

		// the node is released on success and on error alike
		let piped = self.node_client.run(&node, &self.resource, &self.parameters);
		if let Err(error) = self.orchestrator.unlock(&node) {
			warn!("unlock of '{node}' failed: {error:#}");
		}

		let records = piped.with_context(|| format!("while running '{}' on '{node}'", self.resource))?;
		let mut piped_count = 0u32;
		for record in records {
			if record.is_empty() {
				continue; // stray terminator frames are never forwarded
			}
			if self.post_with_retry(record) {
				piped_count += 1;
			}
		}
		self.stats.lock().records_piped += piped_count;
		Ok(())
	}

	fn post_with_retry(&self, blob: Blob) -> bool {
		for _ in 0..POST_ATTEMPTS {
			if !self.active.load(Ordering::Acquire) {
				return false;
			}
			if self.publisher.post(blob.clone(), POST_TIMEOUT).is_ok() {
				return true;
			}
		}
		false
	}
}
