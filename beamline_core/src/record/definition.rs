//! The process-wide record definition registry.
//!
//! Definitions are append-only: once a type name is registered its layout
//! never changes. Re-registering an identical definition is reported as a
//! duplicate and leaves the registry untouched; re-registering a conflicting
//! one is an error.

use super::field::{FieldDef, FieldType, RecordField};
use crate::failure::{FailureKind, failure};
use anyhow::Result;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered record layout.
#[derive(Debug, PartialEq)]
pub struct RecordDefinition {
	pub type_name: String,
	/// Field whose value identifies records of this type, if any.
	pub id_field: Option<String>,
	/// Bytes of the serialized type-name prefix (name plus NUL).
	pub type_size: usize,
	/// Bytes of the fixed-width body. Variable tails extend past this.
	pub data_size: usize,
	pub fields: HashMap<String, RecordField>,
}

impl RecordDefinition {
	/// Total serialized size of a record with a fixed body only.
	#[must_use]
	pub fn record_size(&self) -> usize {
		self.type_size + self.data_size
	}

	pub fn field(&self, name: &str) -> Result<&RecordField> {
		self
			.fields
			.get(name)
			.ok_or_else(|| failure(FailureKind::UnknownRecordType, format!("no field '{name}' in '{}'", self.type_name)))
	}
}

lazy_static! {
	static ref REGISTRY: Mutex<HashMap<String, Arc<RecordDefinition>>> = Mutex::new(HashMap::new());
}

/// Result of a successful `define_record` call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DefineOutcome {
	Created,
	/// An identical definition already existed; nothing changed.
	Duplicate,
}

fn build_fields(type_name: &str, fields: &[FieldDef]) -> Result<HashMap<String, RecordField>> {
	let mut map = HashMap::with_capacity(fields.len());
	for def in fields {
		if def.field_type == FieldType::User && def.ext_type.is_none() {
			return Err(failure(
				FailureKind::UnknownRecordType,
				format!("field '{}' of '{type_name}' is nested but names no definition", def.name),
			));
		}
		let bit_offset = if def.field_type == FieldType::BitField {
			u64::from(def.offset)
		} else {
			u64::from(def.offset) << 3
		};
		let previous = map.insert(
			def.name.clone(),
			RecordField {
				field_type: def.field_type,
				bit_offset,
				elements: def.elements,
				ext_type: def.ext_type.clone(),
				flags: def.flags,
			},
		);
		if previous.is_some() {
			return Err(failure(
				FailureKind::DuplicateDefinition,
				format!("field '{}' appears twice in '{type_name}'", def.name),
			));
		}
	}
	Ok(map)
}

/// Registers a record type. Safe under concurrent first-touch; the first
/// registration wins and identical re-registrations are no-ops.
pub fn define_record(
	type_name: &str,
	id_field: Option<&str>,
	data_size: usize,
	fields: &[FieldDef],
) -> Result<DefineOutcome> {
	let candidate = RecordDefinition {
		type_name: type_name.to_string(),
		id_field: id_field.map(str::to_string),
		type_size: type_name.len() + 1,
		data_size,
		fields: build_fields(type_name, fields)?,
	};

	let mut registry = REGISTRY.lock();
	if let Some(existing) = registry.get(type_name) {
		if **existing == candidate {
			return Ok(DefineOutcome::Duplicate);
		}
		return Err(failure(
			FailureKind::DuplicateDefinition,
			format!("record type '{type_name}' already registered with a different layout"),
		));
	}
	registry.insert(type_name.to_string(), Arc::new(candidate));
	Ok(DefineOutcome::Created)
}

/// Looks up a definition by type name.
pub fn lookup_definition(type_name: &str) -> Result<Arc<RecordDefinition>> {
	REGISTRY
		.lock()
		.get(type_name)
		.cloned()
		.ok_or_else(|| failure(FailureKind::UnknownRecordType, format!("record type '{type_name}' not registered")))
}

/// Whether a type name is registered.
#[must_use]
pub fn is_defined(type_name: &str) -> bool {
	REGISTRY.lock().contains_key(type_name)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::failure::failure_kind_of;
	use crate::record::field::FLAG_NATIVE;

	fn sample_fields() -> Vec<FieldDef> {
		vec![
			FieldDef::new("id", FieldType::UInt64, 0, 1, FLAG_NATIVE),
			FieldDef::new("lat", FieldType::Double, 8, 1, FLAG_NATIVE),
		]
	}

	#[test]
	fn define_and_lookup() {
		assert_eq!(
			define_record("testrec.define", Some("id"), 16, &sample_fields()).unwrap(),
			DefineOutcome::Created
		);
		let def = lookup_definition("testrec.define").unwrap();
		assert_eq!(def.type_size, "testrec.define".len() + 1);
		assert_eq!(def.data_size, 16);
		assert_eq!(def.field("lat").unwrap().byte_offset(), 8);
		assert!(def.field("missing").is_err());
	}

	#[test]
	fn identical_reregistration_is_duplicate() {
		define_record("testrec.dup", None, 16, &sample_fields()).unwrap();
		assert_eq!(
			define_record("testrec.dup", None, 16, &sample_fields()).unwrap(),
			DefineOutcome::Duplicate
		);
	}

	#[test]
	fn conflicting_reregistration_rejects() {
		define_record("testrec.conflict", None, 16, &sample_fields()).unwrap();
		let mut changed = sample_fields();
		changed[1].offset = 4;
		let err = define_record("testrec.conflict", None, 16, &changed).unwrap_err();
		assert_eq!(failure_kind_of(&err), Some(FailureKind::DuplicateDefinition));
		// registry still holds the original
		let def = lookup_definition("testrec.conflict").unwrap();
		assert_eq!(def.field("lat").unwrap().byte_offset(), 8);
	}

	#[test]
	fn unknown_type_reports_kind() {
		let err = lookup_definition("testrec.nonexistent").unwrap_err();
		assert_eq!(failure_kind_of(&err), Some(FailureKind::UnknownRecordType));
	}

	#[test]
	fn nested_field_requires_ext_type() {
		let fields = vec![FieldDef {
			name: "sub".to_string(),
			field_type: FieldType::User,
			offset: 0,
			elements: 1,
			ext_type: None,
			flags: FLAG_NATIVE,
		}];
		assert!(define_record("testrec.badnested", None, 8, &fields).is_err());
	}
}
