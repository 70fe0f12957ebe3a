//! Queue internals: the shared deque, subscriber cursors, and the publisher
//! and subscriber handles.
//!
//! Delivery rules:
//! - FIFO per queue, no ordering across queues.
//! - A `Confidence` subscriber holds back producers when the queue is full;
//!   the producer sees back-pressure as a timeout and owns the retry.
//! - An `Opportunity` subscriber never holds back producers; when the queue is
//!   full the oldest message is overwritten and lagging opportunity cursors
//!   skip forward.
//! - A message leaves the queue once every attached subscriber has received
//!   it; the payload itself lives until the last received view is dropped.

use crate::failure::{FailureKind, failure};
use crate::types::Blob;
use anyhow::Result;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// How a subscriber participates in back-pressure.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubscriberMode {
	/// Delivery is guaranteed: producers block (and time out) rather than drop.
	Confidence,
	/// Delivery is best-effort: new messages overwrite old ones when full.
	Opportunity,
}

/// Default bound used when a queue is created implicitly by name.
pub const DEFAULT_QUEUE_DEPTH: usize = 512;

struct SubscriberState {
	mode: SubscriberMode,
	next_seq: u64,
}

struct QueueState {
	messages: VecDeque<Arc<Blob>>,
	/// Sequence number of `messages.front()`.
	head_seq: u64,
	subscribers: HashMap<u64, SubscriberState>,
	next_subscriber_id: u64,
}

impl QueueState {
	fn tail_seq(&self) -> u64 {
		self.head_seq + self.messages.len() as u64
	}

	/// Lowest sequence any Confidence subscriber still needs, if any.
	fn confidence_floor(&self) -> Option<u64> {
		self
			.subscribers
			.values()
			.filter(|s| s.mode == SubscriberMode::Confidence)
			.map(|s| s.next_seq)
			.min()
	}

	/// Drops fully-consumed messages from the front.
	fn drain_consumed(&mut self) {
		if self.subscribers.is_empty() {
			return;
		}
		let floor = self.subscribers.values().map(|s| s.next_seq).min().unwrap();
		while self.head_seq < floor && !self.messages.is_empty() {
			self.messages.pop_front();
			self.head_seq += 1;
		}
	}
}

/// A named bounded queue. Obtain one through [`attach_queue`].
pub struct MsgQueue {
	name: String,
	capacity: usize,
	state: Mutex<QueueState>,
	readable: Condvar,
	writable: Condvar,
}

impl MsgQueue {
	fn new(name: &str, capacity: usize) -> Self {
		Self {
			name: name.to_string(),
			capacity: capacity.max(1),
			state: Mutex::new(QueueState {
				messages: VecDeque::new(),
				head_seq: 0,
				subscribers: HashMap::new(),
				next_subscriber_id: 0,
			}),
			readable: Condvar::new(),
			writable: Condvar::new(),
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Number of messages currently queued.
	#[must_use]
	pub fn len(&self) -> usize {
		self.state.lock().messages.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn post(&self, payload: Blob, timeout: Duration) -> Result<()> {
		let payload = Arc::new(payload);
		let mut state = self.state.lock();
		loop {
			if state.messages.len() < self.capacity {
				state.messages.push_back(payload);
				self.readable.notify_all();
				return Ok(());
			}
			// Full. Overwrite the oldest message unless a Confidence
			// subscriber still needs it.
			let can_overwrite = match state.confidence_floor() {
				Some(floor) => floor > state.head_seq,
				None => true,
			};
			if can_overwrite {
				log::trace!("queue '{}' overwrote message {}", self.name, state.head_seq);
				state.messages.pop_front();
				state.head_seq += 1;
				state.messages.push_back(payload);
				self.readable.notify_all();
				return Ok(());
			}
			if self.writable.wait_for(&mut state, timeout).timed_out() {
				return Err(failure(
					FailureKind::Timeout,
					format!("queue '{}' full for {:?}", self.name, timeout),
				));
			}
		}
	}

	fn receive(&self, subscriber_id: u64, timeout: Duration) -> Option<MessageRef> {
		let mut state = self.state.lock();
		loop {
			let head_seq = state.head_seq;
			let tail_seq = state.tail_seq();
			let sub = state.subscribers.get_mut(&subscriber_id)?;
			// An overwritten cursor skips to the oldest surviving message.
			if sub.next_seq < head_seq {
				sub.next_seq = head_seq;
			}
			if sub.next_seq < tail_seq {
				let index = (sub.next_seq - head_seq) as usize;
				sub.next_seq += 1;
				let payload = state.messages[index].clone();
				state.drain_consumed();
				self.writable.notify_all();
				return Some(MessageRef { payload });
			}
			if self.readable.wait_for(&mut state, timeout).timed_out() {
				return None;
			}
		}
	}

	fn subscribe(self: &Arc<Self>, mode: SubscriberMode) -> Subscriber {
		let mut state = self.state.lock();
		let id = state.next_subscriber_id;
		state.next_subscriber_id += 1;
		let next_seq = state.head_seq;
		state.subscribers.insert(id, SubscriberState { mode, next_seq });
		Subscriber {
			queue: Arc::clone(self),
			id,
		}
	}

	fn unsubscribe(&self, subscriber_id: u64) {
		let mut state = self.state.lock();
		state.subscribers.remove(&subscriber_id);
		state.drain_consumed();
		self.writable.notify_all();
	}
}

lazy_static! {
	static ref QUEUES: Mutex<HashMap<String, Arc<MsgQueue>>> = Mutex::new(HashMap::new());
}

/// Returns the queue registered under `name`, creating it with the given
/// capacity on first attach. A later attach ignores the capacity argument.
pub fn attach_queue(name: &str, capacity: usize) -> Arc<MsgQueue> {
	let mut queues = QUEUES.lock();
	queues
		.entry(name.to_string())
		.or_insert_with(|| Arc::new(MsgQueue::new(name, capacity)))
		.clone()
}

/// Drops the registry's reference to a queue. Attached handles keep working;
/// the next [`attach_queue`] under the same name starts fresh.
pub fn release_queue(name: &str) {
	QUEUES.lock().remove(name);
}

/// A reference-counted view of one received message. Dropping the view is the
/// mandatory dereference; the payload is freed when the last view goes.
pub struct MessageRef {
	payload: Arc<Blob>,
}

impl MessageRef {
	/// Whether this is the end-of-stream terminator.
	#[must_use]
	pub fn is_terminator(&self) -> bool {
		self.payload.is_empty()
	}
}

impl Deref for MessageRef {
	type Target = Blob;
	fn deref(&self) -> &Blob {
		&self.payload
	}
}

/// Producer handle for a named queue.
pub struct Publisher {
	queue: Arc<MsgQueue>,
}

impl Publisher {
	#[must_use]
	pub fn new(queue_name: &str) -> Self {
		Self {
			queue: attach_queue(queue_name, DEFAULT_QUEUE_DEPTH),
		}
	}

	#[must_use]
	pub fn queue_name(&self) -> &str {
		self.queue.name()
	}

	/// Posts a payload. Back-pressure surfaces as a timeout error; retrying is
	/// the caller's responsibility.
	pub fn post(&self, payload: Blob, timeout: Duration) -> Result<()> {
		self.queue.post(payload, timeout)
	}

	/// Posts the zero-length terminator marking end-of-stream.
	pub fn post_terminator(&self, timeout: Duration) -> Result<()> {
		self.queue.post(Blob::new_empty(), timeout)
	}
}

/// Consumer handle for a named queue. Dropping it detaches the cursor and
/// releases any producers it was holding back.
pub struct Subscriber {
	queue: Arc<MsgQueue>,
	id: u64,
}

impl Subscriber {
	#[must_use]
	pub fn new(queue_name: &str, mode: SubscriberMode) -> Self {
		attach_queue(queue_name, DEFAULT_QUEUE_DEPTH).subscribe(mode)
	}

	#[must_use]
	pub fn queue_name(&self) -> &str {
		self.queue.name()
	}

	/// Receives the next message, or `None` on timeout.
	pub fn receive(&self, timeout: Duration) -> Option<MessageRef> {
		self.queue.receive(self.id, timeout)
	}
}

impl Drop for Subscriber {
	fn drop(&mut self) {
		self.queue.unsubscribe(self.id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	const SHORT: Duration = Duration::from_millis(20);
	const LONG: Duration = Duration::from_millis(2000);

	#[test]
	fn fifo_delivery_to_one_subscriber() {
		let sub = Subscriber::new("testq.fifo", SubscriberMode::Confidence);
		let publisher = Publisher::new("testq.fifo");
		for i in 0..5u8 {
			publisher.post(Blob::from(&[i]), SHORT).unwrap();
		}
		for i in 0..5u8 {
			let msg = sub.receive(SHORT).unwrap();
			assert_eq!(msg.as_slice(), &[i]);
		}
		assert!(sub.receive(SHORT).is_none());
		release_queue("testq.fifo");
	}

	#[test]
	fn every_subscriber_sees_every_message() {
		let sub_a = Subscriber::new("testq.fanout", SubscriberMode::Confidence);
		let sub_b = Subscriber::new("testq.fanout", SubscriberMode::Confidence);
		let publisher = Publisher::new("testq.fanout");
		publisher.post(Blob::from("payload"), SHORT).unwrap();

		assert_eq!(sub_a.receive(SHORT).unwrap().as_slice(), b"payload");
		assert_eq!(sub_b.receive(SHORT).unwrap().as_slice(), b"payload");
		release_queue("testq.fanout");
	}

	#[test]
	fn confidence_subscriber_causes_producer_timeout() {
		let queue = attach_queue("testq.backpressure", 2);
		let _sub = Subscriber::new("testq.backpressure", SubscriberMode::Confidence);
		let publisher = Publisher::new("testq.backpressure");
		assert_eq!(queue.capacity(), 2);

		publisher.post(Blob::from("a"), SHORT).unwrap();
		publisher.post(Blob::from("b"), SHORT).unwrap();
		let err = publisher.post(Blob::from("c"), SHORT).unwrap_err();
		assert_eq!(crate::failure::failure_kind_of(&err), Some(FailureKind::Timeout));
		release_queue("testq.backpressure");
	}

	#[test]
	fn opportunity_subscriber_is_overwritten() {
		let _queue = attach_queue("testq.opportunity", 2);
		let sub = Subscriber::new("testq.opportunity", SubscriberMode::Opportunity);
		let publisher = Publisher::new("testq.opportunity");

		for i in 0..5u8 {
			publisher.post(Blob::from(&[i]), SHORT).unwrap();
		}
		// the two newest survive
		assert_eq!(sub.receive(SHORT).unwrap().as_slice(), &[3]);
		assert_eq!(sub.receive(SHORT).unwrap().as_slice(), &[4]);
		release_queue("testq.opportunity");
	}

	#[test]
	fn blocked_producer_resumes_after_receive() {
		let _queue = attach_queue("testq.resume", 1);
		let sub = Subscriber::new("testq.resume", SubscriberMode::Confidence);
		let publisher = Publisher::new("testq.resume");
		publisher.post(Blob::from("first"), SHORT).unwrap();

		let handle = thread::spawn(move || publisher.post(Blob::from("second"), LONG));
		let first = sub.receive(LONG).unwrap();
		assert_eq!(first.as_slice(), b"first");
		drop(first);
		handle.join().unwrap().unwrap();
		assert_eq!(sub.receive(LONG).unwrap().as_slice(), b"second");
		release_queue("testq.resume");
	}

	#[test]
	fn terminator_is_zero_length() {
		let sub = Subscriber::new("testq.terminator", SubscriberMode::Confidence);
		let publisher = Publisher::new("testq.terminator");
		publisher.post(Blob::from("data"), SHORT).unwrap();
		publisher.post_terminator(SHORT).unwrap();

		assert!(!sub.receive(SHORT).unwrap().is_terminator());
		assert!(sub.receive(SHORT).unwrap().is_terminator());
		release_queue("testq.terminator");
	}

	#[test]
	fn dropping_subscriber_releases_producers() {
		let _queue = attach_queue("testq.detach", 1);
		let sub = Subscriber::new("testq.detach", SubscriberMode::Confidence);
		let publisher = Publisher::new("testq.detach");
		publisher.post(Blob::from("a"), SHORT).unwrap();
		assert!(publisher.post(Blob::from("b"), SHORT).is_err());
		drop(sub);
		publisher.post(Blob::from("b"), SHORT).unwrap();
		release_queue("testq.detach");
	}
}
