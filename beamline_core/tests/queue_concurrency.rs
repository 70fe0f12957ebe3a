//! Concurrency behaviour of the message queues: several producers and
//! subscribers on real threads, back-pressure, and terminator handling.

use beamline_core::msgq::{Publisher, Subscriber, SubscriberMode, attach_queue, release_queue};
use beamline_core::types::Blob;
use std::thread;
use std::time::Duration;

const POST_TIMEOUT: Duration = Duration::from_millis(2000);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(2000);

#[test]
fn multiple_producers_fifo_per_queue() {
	let queue = "itest.msgq.producers";
	let subscriber = Subscriber::new(queue, SubscriberMode::Confidence);

	let producers: Vec<_> = (0u8..4)
		.map(|producer| {
			thread::spawn(move || {
				let publisher = Publisher::new(queue);
				for message in 0u8..50 {
					publisher.post(Blob::from(&[producer, message]), POST_TIMEOUT).unwrap();
				}
			})
		})
		.collect();

	let mut seen_per_producer = [0u8; 4];
	let mut received = 0;
	while received < 200 {
		let message = subscriber.receive(RECEIVE_TIMEOUT).expect("stream stalled");
		let bytes = message.as_slice();
		// messages of one producer arrive in their posted order
		assert_eq!(bytes[1], seen_per_producer[bytes[0] as usize]);
		seen_per_producer[bytes[0] as usize] += 1;
		received += 1;
	}
	for producer in producers {
		producer.join().unwrap();
	}
	assert_eq!(seen_per_producer, [50, 50, 50, 50]);
	release_queue(queue);
}

#[test]
fn slow_confidence_subscriber_backpressures_producers() {
	let queue = "itest.msgq.slow";
	let _bounded = attach_queue(queue, 8);
	let subscriber = Subscriber::new(queue, SubscriberMode::Confidence);

	let producer = thread::spawn(move || {
		let publisher = Publisher::new(queue);
		let mut posted = 0;
		for message in 0u8..64 {
			// generous timeout: the slow reader drains eventually
			publisher.post(Blob::from(&[message]), Duration::from_secs(20)).unwrap();
			posted += 1;
		}
		posted
	});

	let mut received = Vec::new();
	for _ in 0..64 {
		thread::sleep(Duration::from_millis(2));
		let message = subscriber.receive(RECEIVE_TIMEOUT).expect("stream stalled");
		received.push(message.as_slice()[0]);
	}

	assert_eq!(producer.join().unwrap(), 64);
	// guaranteed delivery in order, nothing overwritten
	let expected: Vec<u8> = (0u8..64).collect();
	assert_eq!(received, expected);
	release_queue(queue);
}

#[test]
fn every_subscriber_gets_the_terminator() {
	let queue = "itest.msgq.terminator";
	let subscribers: Vec<Subscriber> = (0..3).map(|_| Subscriber::new(queue, SubscriberMode::Confidence)).collect();

	let publisher = Publisher::new(queue);
	publisher.post(Blob::from("payload"), POST_TIMEOUT).unwrap();
	publisher.post_terminator(POST_TIMEOUT).unwrap();

	let readers: Vec<_> = subscribers
		.into_iter()
		.map(|subscriber| {
			thread::spawn(move || {
				let mut records = 0;
				loop {
					let message = subscriber.receive(RECEIVE_TIMEOUT).expect("stream stalled");
					if message.is_terminator() {
						return records;
					}
					records += 1;
				}
			})
		})
		.collect();

	for reader in readers {
		assert_eq!(reader.join().unwrap(), 1);
	}
	release_queue(queue);
}
