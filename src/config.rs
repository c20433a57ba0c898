//! Configuration for a terrace engine instance.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of snapshots retained on disk after a successful create.
pub const DEFAULT_MAX_RETAINED_SNAPSHOTS: usize = 1;

/// Default capacity of the serialized command inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Default caller-side timeout for synchronous engine RPCs.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for one `(table, partition)` engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Human-readable instance name.
    pub name: String,
    /// Table this instance belongs to.
    pub table: String,
    /// Partition number within the table.
    pub partition: u32,
    /// Root directory for the backend's live state and snapshots.
    /// Exclusive to this instance; nothing else may mutate it.
    pub root_dir: PathBuf,
    /// Snapshots retained on disk after a successful create.
    pub max_retained_snapshots: usize,
    /// Capacity of the serialized command inbox.
    pub inbox_capacity: usize,
    /// Caller-side timeout for synchronous engine RPCs. Timing out does not
    /// cancel in-engine work.
    pub rpc_timeout: Duration,
}

impl EngineConfig {
    /// Create a configuration for one partition with default tuning.
    pub fn for_partition(
        table: impl Into<String>,
        partition: u32,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        let table = table.into();
        Self {
            name: format!("{}.{}", table, partition),
            table,
            partition,
            root_dir: root_dir.into(),
            max_retained_snapshots: DEFAULT_MAX_RETAINED_SNAPSHOTS,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::InvalidConfig {
                field: "name".to_string(),
                reason: "instance name must not be empty".to_string(),
            });
        }

        if self.table.is_empty() {
            return Err(EngineError::InvalidConfig {
                field: "table".to_string(),
                reason: "table name must not be empty".to_string(),
            });
        }

        if self.max_retained_snapshots == 0 {
            return Err(EngineError::InvalidConfig {
                field: "max_retained_snapshots".to_string(),
                reason: "at least one snapshot must be retained".to_string(),
            });
        }

        if self.inbox_capacity == 0 {
            return Err(EngineError::InvalidConfig {
                field: "inbox_capacity".to_string(),
                reason: "inbox capacity must be non-zero".to_string(),
            });
        }

        if self.rpc_timeout.is_zero() {
            return Err(EngineError::InvalidConfig {
                field: "rpc_timeout".to_string(),
                reason: "RPC timeout must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}
