//! Bounded multi-producer, multi-subscriber message queues.
//!
//! Queues are named and process-wide: a publisher and its subscribers attach
//! independently by name. Messages are reference-counted views over a shared
//! payload; a zero-length message is the stream terminator.

mod queue;

pub use queue::*;
