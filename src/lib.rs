//! terrace - a partitioned Raft state-machine apply engine.
//!
//! terrace sits downstream of a Raft consensus layer and upstream of a
//! pluggable storage backend. Each `(table, partition)` pair gets one
//! engine instance that applies consensus-committed records exactly once,
//! in order and without gaps, interleaves reads at the correct applied
//! position, and owns snapshot create/install/retention for its partition.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Consensus layer (external): ordered, committed log         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ApplyEngine: serialized inbox | ordering | dispatch        │
//! │    ├─ AcceptorQueue: commit promises, delayed reads         │
//! │    ├─ FunctionRegistry: registered host functions           │
//! │    └─ SnapshotStore: naming, retention, deletion            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backend: memory | rocksdb | your implementation            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use terrace::{AcceptorQueue, ApplyEngine, EngineConfig, FunctionRegistry, MemoryBackend};
//!
//! #[tokio::main]
//! async fn main() -> terrace::Result<()> {
//!     let config = EngineConfig::for_partition("orders", 0, "/var/lib/terrace/orders/0");
//!     let acceptor = Arc::new(AcceptorQueue::new());
//!     let registry = Arc::new(FunctionRegistry::new());
//!
//!     let (engine, _worker) =
//!         ApplyEngine::spawn(config, MemoryBackend, acceptor, registry)?;
//!     let position = engine.open().await?;
//!     println!("recovered at {}", position);
//!     Ok(())
//! }
//! ```

pub mod acceptor;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod registry;
pub mod snapshot;
pub mod types;

// Re-exports
pub use acceptor::{AcceptorQueue, ReplySender};
pub use backend::memory::MemoryBackend;
pub use backend::rocks::RocksBackend;
pub use backend::{Backend, OpenSnapshotError};
pub use config::EngineConfig;
pub use engine::{ApplyEngine, EngineCommand, EngineHandle};
pub use error::{EngineError, Result};
pub use registry::FunctionRegistry;
pub use snapshot::{parse_snapshot_name, snapshot_name, SnapshotStore, SNAPSHOT_PREFIX};
pub use types::{
    ClientRef, Command, ExecuteCall, LogIndex, LogPosition, LogRecord, MetadataEntry, MetadataKey,
    Reply, Term,
};
