//! The typed record fabric.
//!
//! Every payload that crosses a queue is a self-describing binary record: a
//! NUL-terminated type name followed by a fixed-width body and an optional
//! variable tail. Definitions live in a process-wide registry and are
//! append-only for the life of the process.

mod container;
mod definition;
mod field;
mod record;

pub use container::*;
pub use definition::*;
pub use field::*;
pub use record::*;
