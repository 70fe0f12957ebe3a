//! Core building blocks of the beamline pipeline.
//!
//! Contains the typed record fabric, the bounded publish/subscribe queues that
//! connect pipeline stages, ranged data readers for local and remote granules,
//! the request configuration model, and the failure kinds shared by every
//! stage.

pub mod config;
pub mod failure;
pub mod io;
pub mod msgq;
pub mod record;
pub mod types;

pub use config::*;
pub use failure::*;
pub use types::*;
