//! Core type definitions for the terrace apply engine.
//!
//! This module contains the data model shared by the engine, the acceptor
//! queue and the storage backends: log positions, committed records, the
//! command sum type, and replies delivered to waiting clients.
//!
//! # Type Aliases
//!
//! - [`Term`] = `u64`: Raft term number
//! - [`LogIndex`] = `u64`: Raft log position
//!
//! # Examples
//!
//! ```rust
//! use terrace::types::{Command, LogPosition, LogRecord, ClientRef};
//!
//! let record = LogRecord::new(1, 1, ClientRef::new(), Command::Noop);
//! assert_eq!(record.position(), LogPosition::new(1, 1));
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Identity of a committed log entry: `(index, term)`.
///
/// Ordering is lexicographic by `(index, term)`; progress comparisons use the
/// index, the term is carried along for verification and snapshot naming.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub index: LogIndex,
    pub term: Term,
}

impl LogPosition {
    /// Position of an empty state machine.
    pub const ZERO: Self = Self { index: 0, term: 0 };

    pub fn new(index: LogIndex, term: Term) -> Self {
        Self { index, term }
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.term)
    }
}

/// Opaque client-correlation token used to fulfill the matching promise.
///
/// The engine never inspects the token; it only hands it back to the
/// acceptor queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientRef(pub Uuid);

impl ClientRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invocation descriptor for a registered host function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCall {
    /// Table the call targets.
    pub table: String,
    /// Routing key within the table; opaque to the engine.
    pub key: Vec<u8>,
    /// Registered module identifier.
    pub module: String,
    /// Registered function identifier.
    pub function: String,
    /// Opaque argument blobs, forwarded verbatim.
    pub args: Vec<Vec<u8>>,
}

/// A command carried by a committed log entry.
///
/// The engine inspects only the variant tag; `Config` payloads and `User`
/// blobs pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Advances the applied position; the reply is backend-defined.
    Noop,
    /// Persists cluster configuration under the reserved `config` key.
    Config(Vec<u8>),
    /// Invokes a registered host function.
    Execute(ExecuteCall),
    /// Forwarded verbatim to the backend's apply.
    User(Vec<u8>),
}

/// A committed log entry handed to the engine by the consensus layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: LogIndex,
    pub term: Term,
    pub client: ClientRef,
    pub command: Command,
}

impl LogRecord {
    pub fn new(index: LogIndex, term: Term, client: ClientRef, command: Command) -> Self {
        Self {
            index,
            term,
            client,
            command,
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.index, self.term)
    }
}

/// Reply delivered to a waiting client promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// The command was applied; no payload.
    Done,
    /// Opaque payload produced by the backend or a host function.
    Payload(Vec<u8>),
    /// The command failed; the cause is delivered to the client.
    Error(String),
    /// The partition lost leadership before the command completed.
    NotLeader,
}

/// Wire name of the reserved cluster-configuration metadata key.
pub const CONFIG_KEY: &str = "config";

/// Symbolic identifier of a versioned metadata entry.
///
/// `Config` is reserved for cluster configuration; every other key is an
/// opaque tag the engine stores and returns without interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKey {
    Config,
    Tag(String),
}

impl MetadataKey {
    pub fn as_str(&self) -> &str {
        match self {
            MetadataKey::Config => CONFIG_KEY,
            MetadataKey::Tag(tag) => tag,
        }
    }
}

impl std::fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A versioned metadata value: the position at which it was written, plus
/// the opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub version: LogPosition,
    pub value: Vec<u8>,
}
