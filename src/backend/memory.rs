//! In-memory reference backend.
//!
//! Holds the partition state as plain maps and persists the whole state with
//! bincode under `<root_dir>/live/state.bin` after every mutation, so that
//! `open` recovers durable progress. Small and deterministic; the test suite
//! and single-node development setups run on it.
//!
//! `User` command payloads decode to the [`KvOp`] protocol. A payload that
//! does not decode is answered with an error reply without touching the
//! maps; that is a successful, deterministic apply.

use super::{Backend, OpenSnapshotError};
use crate::error::{EngineError, Result};
use crate::types::{Command, LogPosition, MetadataEntry, MetadataKey, Reply};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LIVE_DIR: &str = "live";
const STATE_FILE: &str = "state.bin";

/// Key/value operations carried in `User` command payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Get { key: Vec<u8> },
}

impl KvOp {
    /// Encode into a `Command::User` payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MemoryState {
    position: LogPosition,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    metadata: BTreeMap<String, MetadataEntry>,
    applied_ops: u64,
}

/// Exclusive handle over one partition's in-memory state.
pub struct MemoryHandle {
    state: MemoryState,
    state_path: PathBuf,
}

impl MemoryHandle {
    fn persist(&self) -> Result<()> {
        let bytes = bincode::serialize(&self.state)?;
        let tmp = self.state_path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Value stored under `key`, if any. Read-only; usable from host
    /// functions.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.state.data.get(key).map(Vec::as_slice)
    }

    /// Number of live key/value entries. Read-only; usable from host
    /// functions.
    pub fn len(&self) -> usize {
        self.state.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.data.is_empty()
    }
}

/// Deterministic in-memory KV backend with file-backed recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBackend;

impl MemoryBackend {
    fn load_state(state_path: &Path) -> Result<MemoryState> {
        match std::fs::read(state_path) {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MemoryState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the reply and whether the KV maps changed.
    fn apply_kv(state: &mut MemoryState, payload: &[u8]) -> (Reply, bool) {
        let op: KvOp = match bincode::deserialize(payload) {
            Ok(op) => op,
            Err(e) => {
                debug!(error = %e, "undecodable user command");
                return (Reply::Error(format!("malformed user command: {}", e)), false);
            }
        };
        match op {
            KvOp::Put { key, value } => {
                state.data.insert(key, value);
                (Reply::Done, true)
            }
            KvOp::Delete { key } => {
                let removed = state.data.remove(&key).is_some();
                (Reply::Done, removed)
            }
            KvOp::Get { key } => match state.data.get(&key) {
                Some(value) => (Reply::Payload(value.clone()), false),
                None => (Reply::Error("key not found".to_string()), false),
            },
        }
    }
}

impl Backend for MemoryBackend {
    type Handle = MemoryHandle;

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn open(
        &self,
        name: &str,
        table: &str,
        partition: u32,
        root_dir: &Path,
    ) -> Result<Self::Handle> {
        let live_dir = root_dir.join(LIVE_DIR);
        std::fs::create_dir_all(&live_dir)
            .map_err(|e| EngineError::BackendOpen(format!("{}: {}", live_dir.display(), e)))?;
        let state_path = live_dir.join(STATE_FILE);
        let state = Self::load_state(&state_path)
            .map_err(|e| EngineError::BackendOpen(format!("{}: {}", state_path.display(), e)))?;
        debug!(name, table, partition, position = %state.position, "opened memory backend");
        Ok(MemoryHandle { state, state_path })
    }

    fn position(&self, handle: &Self::Handle) -> Result<LogPosition> {
        Ok(handle.state.position)
    }

    fn close(&self, handle: Self::Handle) {
        if let Err(e) = handle.persist() {
            warn!(error = %e, "failed to persist state at close");
        }
    }

    fn apply(
        &self,
        command: &Command,
        position: LogPosition,
        handle: &mut Self::Handle,
    ) -> Result<Reply> {
        let (reply, dirty) = match command {
            Command::Noop => (Reply::Done, false),
            Command::User(payload) => Self::apply_kv(&mut handle.state, payload),
            // Config and Execute are dispatched by the engine itself and
            // never reach backend apply.
            Command::Config(_) | Command::Execute(_) => (
                Reply::Error("command is not backend-applied".to_string()),
                false,
            ),
        };

        // An apply at an already-covered position is the read path; there
        // is no progress to record for it.
        let advanced = position > handle.state.position;
        if advanced {
            handle.state.position = position;
            handle.state.applied_ops += 1;
        }
        if dirty || advanced {
            handle.persist()?;
        }
        Ok(reply)
    }

    fn create_snapshot(&self, path: &Path, handle: &Self::Handle) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| EngineError::Snapshot(format!("{}: no parent", path.display())))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::Snapshot(format!("{}: invalid name", path.display())))?;

        // Stage under a dotted name so a crashed attempt is never mistaken
        // for a snapshot, then rename into place.
        let staging = parent.join(format!(".{}.tmp", name));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        let bytes = bincode::serialize(&handle.state)?;
        std::fs::write(staging.join(STATE_FILE), bytes)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    fn open_snapshot(
        &self,
        path: &Path,
        position: LogPosition,
        handle: Self::Handle,
    ) -> std::result::Result<Self::Handle, OpenSnapshotError<Self::Handle>> {
        let state = match Self::load_state(&path.join(STATE_FILE)) {
            Ok(state) => state,
            Err(e) => return Err(OpenSnapshotError::new(handle, e)),
        };
        if state.position != position {
            return Err(OpenSnapshotError::new(
                handle,
                EngineError::SnapshotPositionMismatch {
                    expected: position,
                    found: state.position,
                },
            ));
        }

        let next = MemoryHandle {
            state,
            state_path: handle.state_path.clone(),
        };
        if let Err(e) = next.persist() {
            return Err(OpenSnapshotError::new(handle, e));
        }
        Ok(next)
    }

    fn status(&self, handle: &Self::Handle) -> Vec<(String, String)> {
        vec![
            ("backend_entries".to_string(), handle.state.data.len().to_string()),
            ("backend_applied_ops".to_string(), handle.state.applied_ops.to_string()),
        ]
    }

    fn write_metadata(
        &self,
        handle: &mut Self::Handle,
        key: &MetadataKey,
        version: LogPosition,
        value: &[u8],
    ) -> Result<()> {
        handle.state.metadata.insert(
            key.as_str().to_string(),
            MetadataEntry {
                version,
                value: value.to_vec(),
            },
        );
        // Metadata writes are applies too: the reported position must cover
        // them so recovery does not replay a gap it cannot see.
        if version > handle.state.position {
            handle.state.position = version;
        }
        handle.persist()?;
        Ok(())
    }

    fn read_metadata(
        &self,
        handle: &Self::Handle,
        key: &MetadataKey,
    ) -> Result<Option<MetadataEntry>> {
        Ok(handle.state.metadata.get(key.as_str()).cloned())
    }
}
