//! Pure domain model for streamed analysis jobs.
//!
//! Holds the stage model, the static stage registries, the pipeline
//! status resolver and the session records mutated by the stream
//! controllers. Nothing in this crate performs I/O; the `stream` crate
//! feeds it events and hands out the snapshots it produces.

pub mod batch;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod stage;
pub mod types;
