//! Record fabric throughput: packing, serializing and field access are on
//! the hot path of every extent batch.

use beamline_core::record::{FLAG_NATIVE, FieldDef, FieldType, Record, define_record};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn register() {
	let fields = vec![
		FieldDef::new("extent_id", FieldType::UInt64, 0, 1, FLAG_NATIVE),
		FieldDef::new("lat", FieldType::Double, 8, 1, FLAG_NATIVE),
		FieldDef::new("lon", FieldType::Double, 16, 1, FLAG_NATIVE),
		FieldDef::new("photon_count", FieldType::UInt32, 24, 1, FLAG_NATIVE),
	];
	let _ = define_record("benchrec", Some("extent_id"), 28, &fields);
}

fn build_record() -> Record {
	let mut record = Record::new("benchrec").unwrap();
	record.set_integer("extent_id", 0, 0x1234_5678).unwrap();
	record.set_real("lat", 0, -71.25).unwrap();
	record.set_real("lon", 0, 145.5).unwrap();
	record.set_integer("photon_count", 0, 120).unwrap();
	record
}

fn bench_record_fabric(c: &mut Criterion) {
	register();
	let record = build_record();
	let bytes = record.serialize();

	c.bench_function("pack_record", |b| b.iter(|| black_box(build_record())));

	c.bench_function("serialize_record", |b| b.iter(|| black_box(record.serialize())));

	c.bench_function("deserialize_record", |b| {
		b.iter(|| black_box(Record::from_bytes(&bytes).unwrap()))
	});

	c.bench_function("typed_field_access", |b| {
		b.iter(|| {
			black_box(record.get_real("lat", 0).unwrap());
			black_box(record.get_integer("photon_count", 0).unwrap());
		})
	});
}

criterion_group!(benches, bench_record_fabric);
criterion_main!(benches);
