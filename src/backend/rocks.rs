//! RocksDB-backed storage backend.
//!
//! Live state for a partition sits in a generation directory under
//! `<root_dir>/live`, selected by a `CURRENT` pointer file:
//!
//! ```text
//! <root_dir>/live/CURRENT        -> "3"
//! <root_dir>/live/gen-3/         -> the open RocksDB
//! ```
//!
//! Snapshot creation uses a RocksDB checkpoint, which materializes a
//! complete database directory and is atomic from the consumer's view.
//! Snapshot install copies the snapshot into the next generation, verifies
//! its position, and only then flips `CURRENT`; a failure at any earlier
//! step leaves the live generation untouched and hands the caller back the
//! original handle.

use super::{Backend, OpenSnapshotError};
use crate::backend::memory::KvOp;
use crate::error::{EngineError, Result};
use crate::types::{Command, LogPosition, MetadataEntry, MetadataKey, Reply};
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LIVE_DIR: &str = "live";
const CURRENT_FILE: &str = "CURRENT";

const POSITION_KEY: &[u8] = b"position";
const META_PREFIX: &[u8] = b"meta_";
const KV_PREFIX: &[u8] = b"kv_";

/// Exclusive handle over one partition's RocksDB state.
pub struct RocksHandle {
    db: DB,
    live_root: PathBuf,
    generation: u64,
}

/// RocksDB backend: durable KV state, checkpoint snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct RocksBackend;

impl RocksBackend {
    fn db_options() -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn generation_dir(live_root: &Path, generation: u64) -> PathBuf {
        live_root.join(format!("gen-{}", generation))
    }

    fn read_current(live_root: &Path) -> Result<Option<u64>> {
        match std::fs::read_to_string(live_root.join(CURRENT_FILE)) {
            Ok(content) => content
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| EngineError::Internal(format!("corrupt CURRENT file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_current(live_root: &Path, generation: u64) -> Result<()> {
        let tmp = live_root.join(format!("{}.tmp", CURRENT_FILE));
        std::fs::write(&tmp, format!("{}\n", generation))?;
        std::fs::rename(&tmp, live_root.join(CURRENT_FILE))?;
        Ok(())
    }

    fn meta_key(key: &MetadataKey) -> Vec<u8> {
        let mut out = META_PREFIX.to_vec();
        out.extend_from_slice(key.as_str().as_bytes());
        out
    }

    fn kv_key(key: &[u8]) -> Vec<u8> {
        let mut out = KV_PREFIX.to_vec();
        out.extend_from_slice(key);
        out
    }

    fn read_position(db: &DB) -> Result<LogPosition> {
        match db.get(POSITION_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(LogPosition::ZERO),
        }
    }

    fn apply_kv(db: &DB, payload: &[u8], position: LogPosition, advance: bool) -> Result<Reply> {
        let op: KvOp = match bincode::deserialize(payload) {
            Ok(op) => op,
            Err(e) => {
                debug!(error = %e, "undecodable user command");
                if advance {
                    Self::put_position(db, position)?;
                }
                return Ok(Reply::Error(format!("malformed user command: {}", e)));
            }
        };
        let mut batch = WriteBatch::default();
        let reply = match op {
            KvOp::Put { key, value } => {
                batch.put(Self::kv_key(&key), value);
                Reply::Done
            }
            KvOp::Delete { key } => {
                batch.delete(Self::kv_key(&key));
                Reply::Done
            }
            KvOp::Get { key } => match db.get(Self::kv_key(&key))? {
                Some(value) => Reply::Payload(value),
                None => Reply::Error("key not found".to_string()),
            },
        };
        if advance {
            batch.put(POSITION_KEY, bincode::serialize(&position)?);
        }
        if !batch.is_empty() {
            db.write(batch)?;
        }
        Ok(reply)
    }

    fn put_position(db: &DB, position: LogPosition) -> Result<()> {
        db.put(POSITION_KEY, bincode::serialize(&position)?)?;
        Ok(())
    }
}

impl Backend for RocksBackend {
    type Handle = RocksHandle;

    fn kind(&self) -> &'static str {
        "rocksdb"
    }

    fn open(
        &self,
        name: &str,
        table: &str,
        partition: u32,
        root_dir: &Path,
    ) -> Result<Self::Handle> {
        let live_root = root_dir.join(LIVE_DIR);
        std::fs::create_dir_all(&live_root)
            .map_err(|e| EngineError::BackendOpen(format!("{}: {}", live_root.display(), e)))?;

        let generation = match Self::read_current(&live_root)? {
            Some(generation) => generation,
            None => {
                Self::write_current(&live_root, 1)?;
                1
            }
        };

        let db = DB::open(
            &Self::db_options(),
            Self::generation_dir(&live_root, generation),
        )
        .map_err(|e| EngineError::BackendOpen(e.to_string()))?;

        debug!(name, table, partition, generation, "opened rocksdb backend");
        Ok(RocksHandle {
            db,
            live_root,
            generation,
        })
    }

    fn position(&self, handle: &Self::Handle) -> Result<LogPosition> {
        Self::read_position(&handle.db)
    }

    fn close(&self, handle: Self::Handle) {
        if let Err(e) = handle.db.flush() {
            warn!(error = %e, "failed to flush rocksdb at close");
        }
    }

    fn apply(
        &self,
        command: &Command,
        position: LogPosition,
        handle: &mut Self::Handle,
    ) -> Result<Reply> {
        // An apply at an already-covered position is the read path; there
        // is no progress to record for it.
        let advance = position > Self::read_position(&handle.db)?;
        match command {
            Command::Noop => {
                if advance {
                    Self::put_position(&handle.db, position)?;
                }
                Ok(Reply::Done)
            }
            Command::User(payload) => Self::apply_kv(&handle.db, payload, position, advance),
            // Config and Execute are dispatched by the engine itself and
            // never reach backend apply.
            Command::Config(_) | Command::Execute(_) => {
                if advance {
                    Self::put_position(&handle.db, position)?;
                }
                Ok(Reply::Error("command is not backend-applied".to_string()))
            }
        }
    }

    fn create_snapshot(&self, path: &Path, handle: &Self::Handle) -> Result<()> {
        handle.db.flush()?;
        Checkpoint::new(&handle.db)?
            .create_checkpoint(path)
            .map_err(|e| EngineError::Snapshot(e.to_string()))?;
        Ok(())
    }

    fn open_snapshot(
        &self,
        path: &Path,
        position: LogPosition,
        handle: Self::Handle,
    ) -> std::result::Result<Self::Handle, OpenSnapshotError<Self::Handle>> {
        let next_generation = handle.generation + 1;
        let staging = Self::generation_dir(&handle.live_root, next_generation);

        let cleanup = |staging: &Path| {
            if let Err(e) = std::fs::remove_dir_all(staging) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, path = %staging.display(), "failed to clean staged generation");
                }
            }
        };

        cleanup(&staging);
        if let Err(e) = copy_dir_recursive(path, &staging) {
            cleanup(&staging);
            return Err(OpenSnapshotError::new(handle, e));
        }

        let db = match DB::open(&Self::db_options(), &staging) {
            Ok(db) => db,
            Err(e) => {
                cleanup(&staging);
                return Err(OpenSnapshotError::new(handle, e.into()));
            }
        };

        match Self::read_position(&db) {
            Ok(found) if found == position => {}
            Ok(found) => {
                drop(db);
                cleanup(&staging);
                return Err(OpenSnapshotError::new(
                    handle,
                    EngineError::SnapshotPositionMismatch {
                        expected: position,
                        found,
                    },
                ));
            }
            Err(e) => {
                drop(db);
                cleanup(&staging);
                return Err(OpenSnapshotError::new(handle, e));
            }
        }

        if let Err(e) = Self::write_current(&handle.live_root, next_generation) {
            drop(db);
            cleanup(&staging);
            return Err(OpenSnapshotError::new(handle, e));
        }

        // Committed: the pointer now names the new generation. Retire the
        // old one best-effort.
        let RocksHandle {
            db: old_db,
            live_root,
            generation: old_generation,
        } = handle;
        drop(old_db);
        cleanup(&Self::generation_dir(&live_root, old_generation));

        Ok(RocksHandle {
            db,
            live_root,
            generation: next_generation,
        })
    }

    fn status(&self, handle: &Self::Handle) -> Vec<(String, String)> {
        let mut items = vec![(
            "backend_generation".to_string(),
            handle.generation.to_string(),
        )];
        if let Ok(Some(keys)) = handle.db.property_int_value("rocksdb.estimate-num-keys") {
            items.push(("backend_estimated_keys".to_string(), keys.to_string()));
        }
        items
    }

    fn write_metadata(
        &self,
        handle: &mut Self::Handle,
        key: &MetadataKey,
        version: LogPosition,
        value: &[u8],
    ) -> Result<()> {
        let entry = MetadataEntry {
            version,
            value: value.to_vec(),
        };
        let mut batch = WriteBatch::default();
        batch.put(Self::meta_key(key), bincode::serialize(&entry)?);
        // Metadata writes are applies too: the reported position must cover
        // them so recovery does not replay a gap it cannot see.
        if version > Self::read_position(&handle.db)? {
            batch.put(POSITION_KEY, bincode::serialize(&version)?);
        }
        handle.db.write(batch)?;
        Ok(())
    }

    fn read_metadata(
        &self,
        handle: &Self::Handle,
        key: &MetadataKey,
    ) -> Result<Option<MetadataEntry>> {
        match handle.db.get(Self::meta_key(key))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(key: &[u8], value: &[u8]) -> Command {
        Command::User(
            KvOp::Put {
                key: key.to_vec(),
                value: value.to_vec(),
            }
            .encode()
            .unwrap(),
        )
    }

    fn get(key: &[u8]) -> Command {
        Command::User(KvOp::Get { key: key.to_vec() }.encode().unwrap())
    }

    #[test]
    fn test_open_apply_recover() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend;

        let mut handle = backend.open("orders.0", "orders", 0, dir.path()).unwrap();
        assert_eq!(backend.position(&handle).unwrap(), LogPosition::ZERO);

        backend
            .apply(&put(b"k", b"v"), LogPosition::new(1, 1), &mut handle)
            .unwrap();
        backend.close(handle);

        let reopened = backend.open("orders.0", "orders", 0, dir.path()).unwrap();
        assert_eq!(backend.position(&reopened).unwrap(), LogPosition::new(1, 1));
        let reply = {
            let mut h = reopened;
            let reply = backend
                .apply(&get(b"k"), LogPosition::new(2, 1), &mut h)
                .unwrap();
            backend.close(h);
            reply
        };
        assert_eq!(reply, Reply::Payload(b"v".to_vec()));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend;
        let mut handle = backend.open("orders.0", "orders", 0, dir.path()).unwrap();

        backend
            .write_metadata(&mut handle, &MetadataKey::Config, LogPosition::new(3, 2), b"members")
            .unwrap();
        let entry = backend
            .read_metadata(&handle, &MetadataKey::Config)
            .unwrap()
            .unwrap();
        assert_eq!(entry.version, LogPosition::new(3, 2));
        assert_eq!(entry.value, b"members");
        assert_eq!(backend.position(&handle).unwrap(), LogPosition::new(3, 2));
    }

    #[test]
    fn test_checkpoint_snapshot_install() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend;
        let mut handle = backend.open("orders.0", "orders", 0, dir.path()).unwrap();

        backend
            .apply(&put(b"k", b"v"), LogPosition::new(1, 1), &mut handle)
            .unwrap();
        let snap = dir.path().join("snapshot.1.1");
        backend.create_snapshot(&snap, &handle).unwrap();
        assert!(snap.is_dir());

        // Diverge, then install the snapshot over the live state.
        backend
            .apply(&put(b"extra", b"x"), LogPosition::new(2, 1), &mut handle)
            .unwrap();
        let mut handle = match backend.open_snapshot(&snap, LogPosition::new(1, 1), handle) {
            Ok(handle) => handle,
            Err(_) => panic!("snapshot install failed"),
        };
        assert_eq!(backend.position(&handle).unwrap(), LogPosition::new(1, 1));
        assert_eq!(handle.generation, 2);

        let reply = backend
            .apply(&get(b"extra"), LogPosition::new(2, 1), &mut handle)
            .unwrap();
        assert_eq!(reply, Reply::Error("key not found".to_string()));
    }

    #[test]
    fn test_failed_install_returns_original_handle() {
        let dir = tempdir().unwrap();
        let backend = RocksBackend;
        let mut handle = backend.open("orders.0", "orders", 0, dir.path()).unwrap();

        backend
            .apply(&put(b"k", b"v"), LogPosition::new(1, 1), &mut handle)
            .unwrap();
        let snap = dir.path().join("snapshot.1.1");
        backend.create_snapshot(&snap, &handle).unwrap();

        let err = match backend.open_snapshot(&snap, LogPosition::new(7, 7), handle) {
            Ok(_) => panic!("mismatched install must fail"),
            Err(err) => err,
        };
        assert!(matches!(
            err.error,
            EngineError::SnapshotPositionMismatch { .. }
        ));
        let mut handle = err.handle;
        assert_eq!(handle.generation, 1);
        let reply = backend
            .apply(&get(b"k"), LogPosition::new(2, 1), &mut handle)
            .unwrap();
        assert_eq!(reply, Reply::Payload(b"v".to_vec()));
    }
}
