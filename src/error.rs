//! Error types for the terrace apply engine.
//!
//! This module provides the unified error type [`EngineError`] for all engine
//! operations, along with a convenient [`Result`] type alias.
//!
//! Only ordering violations and backend failures during the apply path are
//! fatal to an engine instance; everything else is reported to the caller and
//! leaves the instance running.

use crate::types::LogPosition;
use std::io;
use thiserror::Error;

/// Main error type for terrace operations.
#[derive(Error, Debug)]
pub enum EngineError {
    // Apply ordering errors
    #[error("out-of-order apply: expected index {expected}, received {received}")]
    OutOfOrderApply { expected: u64, received: u64 },

    #[error("apply failed at {position}: {cause}")]
    ApplyFailed { position: LogPosition, cause: String },

    // Backend errors
    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend refused to open: {0}")]
    BackendOpen(String),

    // Snapshot errors
    #[error("no snapshot directory for position {0}")]
    SnapshotNotFound(LogPosition),

    #[error("snapshot position mismatch: directory holds {found}, expected {expected}")]
    SnapshotPositionMismatch {
        expected: LogPosition,
        found: LogPosition,
    },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    // Engine lifecycle errors
    #[error("engine is not running")]
    EngineStopped,

    #[error("request timeout after {0}ms")]
    Timeout(u64),

    // Configuration errors
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Check if this error terminates the engine instance.
    ///
    /// A fatal error means the supervisor must restart the instance so that
    /// init re-reads the backend position.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::OutOfOrderApply { .. } | EngineError::ApplyFailed { .. }
        )
    }
}

impl From<rocksdb::Error> for EngineError {
    fn from(e: rocksdb::Error) -> Self {
        EngineError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for EngineError {
    fn from(e: bincode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Result type alias for terrace operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::OutOfOrderApply {
            expected: 3,
            received: 5
        }
        .is_fatal());
        assert!(EngineError::ApplyFailed {
            position: LogPosition::new(4, 2),
            cause: "disk full".into()
        }
        .is_fatal());
        assert!(!EngineError::Timeout(5000).is_fatal());
        assert!(!EngineError::Backend("busy".into()).is_fatal());
    }
}
