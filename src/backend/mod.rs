//! Storage backend contract.
//!
//! A backend materializes the replicated state of one `(table, partition)`
//! pair. The engine owns exactly one handle per instance, invokes every
//! operation from its serialized context, and never shares the handle across
//! threads. Backends may block internally; the engine waits.
//!
//! # Determinism
//!
//! For any prefix of the committed command stream, two backends started from
//! position `(0,0)` and fed the same prefix must agree on all replies and on
//! exported metadata. A backend that cannot uphold this after reporting an
//! apply error must not report apply errors at all.

pub mod memory;
pub mod rocks;

use crate::error::{EngineError, Result};
use crate::types::{Command, LogPosition, MetadataEntry, MetadataKey, Reply};
use std::path::Path;

/// Failed snapshot install. The live handle is handed back so the engine's
/// state is unchanged.
pub struct OpenSnapshotError<H> {
    pub handle: H,
    pub error: EngineError,
}

impl<H> OpenSnapshotError<H> {
    pub fn new(handle: H, error: EngineError) -> Self {
        Self { handle, error }
    }
}

/// Abstract storage capability set consumed by the apply engine.
pub trait Backend: Send + Sync + 'static {
    /// Exclusive access token for one partition's materialized state.
    type Handle: Send + 'static;

    /// Short backend identifier used in status reporting.
    fn kind(&self) -> &'static str;

    /// Open (or recover) the partition state under `root_dir`.
    /// Failure is fatal to the instance.
    fn open(&self, name: &str, table: &str, partition: u32, root_dir: &Path)
        -> Result<Self::Handle>;

    /// Current applied position; `(0,0)` if empty.
    fn position(&self, handle: &Self::Handle) -> Result<LogPosition>;

    /// Close the handle. Called exactly once at shutdown.
    fn close(&self, handle: Self::Handle);

    /// Apply one committed command at `position`, mutating state in place.
    ///
    /// Must be deterministic for identical inputs. A logically rejected
    /// command is still a successful apply: return `Reply::Error` and
    /// advance the reported position. An `Err` return is trusted to mean
    /// the replica can no longer prove it matches its peers.
    fn apply(&self, command: &Command, position: LogPosition, handle: &mut Self::Handle)
        -> Result<Reply>;

    /// Materialize a self-contained snapshot directory at `path`.
    /// The directory must appear atomically (rename-on-finish or an
    /// equivalent mechanism); `path` does not exist when called.
    fn create_snapshot(&self, path: &Path, handle: &Self::Handle) -> Result<()>;

    /// Replace live state with the snapshot at `path`, expected to hold
    /// `position`. Consumes the live handle and returns its replacement; on
    /// failure the original handle is handed back untouched.
    fn open_snapshot(
        &self,
        path: &Path,
        position: LogPosition,
        handle: Self::Handle,
    ) -> std::result::Result<Self::Handle, OpenSnapshotError<Self::Handle>>;

    /// Backend-specific status items, appended to the engine's own.
    fn status(&self, handle: &Self::Handle) -> Vec<(String, String)>;

    /// Store a versioned opaque blob under `key`.
    fn write_metadata(
        &self,
        handle: &mut Self::Handle,
        key: &MetadataKey,
        version: LogPosition,
        value: &[u8],
    ) -> Result<()>;

    /// Read the versioned blob under `key`, if present.
    fn read_metadata(&self, handle: &Self::Handle, key: &MetadataKey)
        -> Result<Option<MetadataEntry>>;
}
