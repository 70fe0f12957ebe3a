//! The `subset` tool: run one granule through the subsetter and, when raster
//! sources are attached, through the sample dispatcher.

use super::{drain_and_count, print_counts, tap};
use beamline_core::config::RequestConfig;
use beamline_pipeline::{DispatchRequest, SampleDispatcher, SubsetRequest, Subsetter, register_pipeline_records};
use beamline_raster::{IndexedRaster, RasterSource, SingleRaster};
use anyhow::{Context, Result};
use clap::Args;
use log::info;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

#[derive(Args, Debug)]
#[command(arg_required_else_help = true)]
pub struct Subcommand {
	/// Granule location: a path, file:// or http(s):// URL
	pub granule: String,

	/// Request parameters as inline JSON or @file
	#[arg(long, short, default_value = "{}")]
	pub params: String,

	/// Output queue name
	#[arg(long, default_value = "subset-output")]
	pub queue: String,
}

pub fn run(arguments: &Subcommand) -> Result<()> {
	register_pipeline_records();

	let json = match arguments.params.strip_prefix('@') {
		Some(path) => std::fs::read_to_string(path).with_context(|| format!("while reading parameters from '{path}'"))?,
		None => arguments.params.clone(),
	};
	let config = Arc::new(RequestConfig::from_json(&json)?);
	let active = Arc::new(AtomicBool::new(true));

	// attached raster sources; the dispatcher bridges extents to samples
	let mut sources: Vec<Arc<dyn RasterSource>> = Vec::new();
	for attachment in &config.rasters {
		let source: Arc<dyn RasterSource> = if attachment.single {
			Arc::new(SingleRaster::open(&attachment.key, &attachment.location, config.clone())?)
		} else {
			Arc::new(IndexedRaster::open(&attachment.key, &attachment.location, config.clone())?)
		};
		sources.push(source);
	}

	let extent_queue = arguments.queue.clone();
	let sample_queue = format!("{}-samples", arguments.queue);
	let extent_tap = tap(&extent_queue);
	let sample_tap = if sources.is_empty() { None } else { Some(tap(&sample_queue)) };

	let dispatcher = if sources.is_empty() {
		None
	} else {
		let request = DispatchRequest {
			extent_queue: extent_queue.clone(),
			output_queue: sample_queue.clone(),
			sources,
			active: active.clone(),
		};
		Some(std::thread::spawn(move || SampleDispatcher::run(&request)))
	};

	let stats = Subsetter::run(&SubsetRequest {
		resource: arguments.granule.clone(),
		config,
		output_queue: extent_queue.clone(),
		active,
	})?;
	info!(
		"{}: {} segments read, {} extents sent, {} filtered",
		arguments.granule, stats.segments_read, stats.extents_sent, stats.extents_filtered
	);

	let drain_timeout = Duration::from_millis(2000);
	print_counts(&extent_queue, &drain_and_count(&extent_tap, drain_timeout));

	if let Some(handle) = dispatcher {
		let dispatch_stats = handle.join().expect("dispatcher panicked")?;
		info!(
			"dispatch: {} extents sampled, {} sample records",
			dispatch_stats.extents_seen, dispatch_stats.sample_records
		);
		if let Some(sample_tap) = sample_tap {
			print_counts(&sample_queue, &drain_and_count(&sample_tap, drain_timeout));
		}
	}
	Ok(())
}
