//! Failure kinds shared by every pipeline stage.
//!
//! Errors are kinds, not control flow: a worker that hits one emits a
//! structured exception record on its request's output queue and exits its own
//! loop. The kinds below carry stable numeric codes so exception records stay
//! parseable across versions.

use std::fmt;

/// The failure kinds a request can surface.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailureKind {
	/// A timed wait or I/O read ran out of time.
	Timeout,
	/// The subset selected nothing. Expected, never logged as an error.
	Empty,
	/// A granule, dataset or raster was not where the request said it was.
	ResourceMissing,
	/// A signature, version or layout the reader does not understand.
	UnsupportedFormat,
	/// A filter id outside the supported pipeline (deflate, shuffle, fletcher32).
	UnsupportedFilter,
	/// Fletcher32 verification failed on a chunk.
	ChecksumMismatch,
	/// A filter pipeline stage failed to decode.
	FilterError,
	/// The subset memory pool was exhausted. Local to one tile sampling.
	OutOfMemory,
	/// The orchestrator could not be reached.
	OrchestratorUnavailable,
	/// The orchestrator refused or timed out a node lock.
	NodeLockFailed,
	/// A record type name missing from the registry.
	UnknownRecordType,
	/// An element index beyond a field's declared count.
	OutOfRange,
	/// A caller-supplied buffer too small for serialization.
	UndersizedBuffer,
	/// A pointer field dereferenced while holding 0.
	BadNullPointer,
	/// A record definition re-registered; the registry is unchanged.
	DuplicateDefinition,
}

impl FailureKind {
	/// Stable numeric code carried by exception records.
	#[must_use]
	pub fn code(&self) -> i32 {
		match self {
			FailureKind::Timeout => 1,
			FailureKind::Empty => 2,
			FailureKind::ResourceMissing => 3,
			FailureKind::UnsupportedFormat => 4,
			FailureKind::UnsupportedFilter => 5,
			FailureKind::ChecksumMismatch => 6,
			FailureKind::FilterError => 7,
			FailureKind::OutOfMemory => 8,
			FailureKind::OrchestratorUnavailable => 9,
			FailureKind::NodeLockFailed => 10,
			FailureKind::UnknownRecordType => 20,
			FailureKind::OutOfRange => 21,
			FailureKind::UndersizedBuffer => 22,
			FailureKind::BadNullPointer => 23,
			FailureKind::DuplicateDefinition => 24,
		}
	}
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			FailureKind::Timeout => "timeout",
			FailureKind::Empty => "empty subset",
			FailureKind::ResourceMissing => "resource missing",
			FailureKind::UnsupportedFormat => "unsupported format",
			FailureKind::UnsupportedFilter => "unsupported filter",
			FailureKind::ChecksumMismatch => "checksum mismatch",
			FailureKind::FilterError => "filter error",
			FailureKind::OutOfMemory => "out of memory",
			FailureKind::OrchestratorUnavailable => "orchestrator unavailable",
			FailureKind::NodeLockFailed => "node lock failed",
			FailureKind::UnknownRecordType => "unknown record type",
			FailureKind::OutOfRange => "element index out of range",
			FailureKind::UndersizedBuffer => "undersized buffer",
			FailureKind::BadNullPointer => "bad null pointer",
			FailureKind::DuplicateDefinition => "duplicate record definition",
		};
		f.write_str(name)
	}
}

/// A typed failure: a kind plus a human-readable message. Convertible into
/// `anyhow::Error` and recoverable from one via [`failure_kind_of`].
#[derive(Debug, Clone)]
pub struct Failure {
	pub kind: FailureKind,
	pub message: String,
}

impl Failure {
	#[must_use]
	pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
		}
	}
}

impl fmt::Display for Failure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}: {}", self.kind, self.message)
	}
}

impl std::error::Error for Failure {}

/// Builds an `anyhow::Error` carrying the given kind.
#[must_use]
pub fn failure(kind: FailureKind, message: impl Into<String>) -> anyhow::Error {
	anyhow::Error::new(Failure::new(kind, message))
}

/// Extracts the innermost typed kind from an error chain, if any stage
/// attached one.
#[must_use]
pub fn failure_kind_of(error: &anyhow::Error) -> Option<FailureKind> {
	error.chain().find_map(|cause| cause.downcast_ref::<Failure>().map(|f| f.kind))
}
