pub mod fanout;
pub mod subset;

use beamline_core::msgq::{Subscriber, SubscriberMode};
use beamline_core::record::Record;
use std::collections::BTreeMap;
use std::time::Duration;

/// Drains a queue until its terminator, counting records by type name.
pub fn drain_and_count(subscriber: &Subscriber, timeout: Duration) -> BTreeMap<String, usize> {
	let mut counts = BTreeMap::new();
	while let Some(message) = subscriber.receive(timeout) {
		if message.is_terminator() {
			break;
		}
		let type_name = Record::from_bytes(message.as_slice())
			.map(|record| record.type_name().to_string())
			.unwrap_or_else(|_| "unparseable".to_string());
		*counts.entry(type_name).or_insert(0) += 1;
	}
	counts
}

/// Attaches a counting subscriber to a queue before a run starts.
pub fn tap(queue: &str) -> Subscriber {
	Subscriber::new(queue, SubscriberMode::Confidence)
}

pub fn print_counts(label: &str, counts: &BTreeMap<String, usize>) {
	if counts.is_empty() {
		println!("{label}: no records");
		return;
	}
	let summary: Vec<String> = counts.iter().map(|(name, count)| format!("{count} {name}")).collect();
	println!("{label}: {}", summary.join(", "));
}
