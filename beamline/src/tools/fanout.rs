//! The `fanout` tool: distribute a multi-granule request across worker nodes
//! registered with an orchestrator.

use super::{drain_and_count, print_counts, tap};
use beamline_pipeline::{FanoutProxy, HttpNodeClient, HttpOrchestrator, NODE_LOCK_TIMEOUT, ProxyRequest};
use anyhow::{Context, Result};
use clap::Args;
use log::info;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[derive(Args, Debug)]
#[command(arg_required_else_help = true)]
pub struct Subcommand {
	/// Granule resources to distribute, one per worker node
	#[arg(required = true)]
	pub granules: Vec<String>,

	/// Orchestrator base URL
	#[arg(long)]
	pub orchestrator: String,

	/// Request parameters as inline JSON or @file
	#[arg(long, short, default_value = "{}")]
	pub params: String,

	/// Output queue name
	#[arg(long, default_value = "fanout-output")]
	pub queue: String,

	/// Node lock timeout in seconds
	#[arg(long, default_value_t = NODE_LOCK_TIMEOUT.as_secs())]
	pub lock_timeout: u64,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	let parameters = match arguments.params.strip_prefix('@') {
		Some(path) => std::fs::read_to_string(path).with_context(|| format!("while reading parameters from '{path}'"))?,
		None => arguments.params.clone(),
	};

	let output_tap = tap(&arguments.queue);
	let request = ProxyRequest {
		resources: arguments.granules.clone(),
		parameters,
		output_queue: arguments.queue.clone(),
		orchestrator: Arc::new(HttpOrchestrator::new(&arguments.orchestrator)?),
		node_client: Arc::new(HttpNodeClient::new()?),
		active: Arc::new(AtomicBool::new(true)),
		lock_timeout: Duration::from_secs(arguments.lock_timeout),
	};

	let stats = FanoutProxy::run(&request)?;
	info!(
		"fan-out complete: {} slots, {} records piped, {} failures",
		stats.slots, stats.records_piped, stats.slot_failures
	);
	print_counts(&arguments.queue, &drain_and_count(&output_tap, Duration::from_millis(2000)));
	Ok(())
}
