//! The apply engine: one serialized worker per `(table, partition)` pair.
//!
//! The worker consumes committed records from the consensus layer, drives
//! the storage backend, resolves client promises through the acceptor
//! queue, and owns snapshot create/install/retention for its partition.
//!
//! ## Module Structure
//!
//! - `worker`: the serialized command loop and its ordering contract
//! - `handle`: the async client API over the command inbox

mod handle;
mod worker;

pub use handle::EngineHandle;
pub use worker::{ApplyEngine, EngineCommand};
