//! Block cache behaviour under header-walk style traffic: many small reads
//! clustered within a few lines.

use beamline_archive::{BlockCache, L1_LINE_SIZE};
use beamline_core::io::{DataReader, DataReaderBlob};
use beamline_core::types::{Blob, ByteRange};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn source(len: usize) -> (DataReader, u64) {
	let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
	(DataReaderBlob::new("bench", Blob::from(data)), len as u64)
}

fn bench_block_cache(c: &mut Criterion) {
	let (reader, size) = source(4 * L1_LINE_SIZE as usize);

	c.bench_function("hot_small_reads", |b| {
		let cache = BlockCache::new(size);
		// warm the line once; the loop then measures pure cache hits
		cache.read(&reader, &ByteRange::new(64, 8), L1_LINE_SIZE).unwrap();
		b.iter(|| {
			for offset in (0..4096u64).step_by(16) {
				black_box(cache.read(&reader, &ByteRange::new(offset, 8), L1_LINE_SIZE).unwrap());
			}
		})
	});

	c.bench_function("line_spanning_reads", |b| {
		let cache = BlockCache::new(size);
		b.iter(|| {
			black_box(
				cache
					.read(&reader, &ByteRange::new(L1_LINE_SIZE - 32, 64), L1_LINE_SIZE)
					.unwrap(),
			)
		})
	});
}

criterion_group!(benches, bench_block_cache);
criterion_main!(benches);
