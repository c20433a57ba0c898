//! The serialized apply loop for one partition.

use crate::acceptor::AcceptorQueue;
use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::observability;
use crate::registry::FunctionRegistry;
use crate::snapshot::{snapshot_name, SnapshotStore};
use crate::types::{
    ClientRef, Command, LogPosition, LogRecord, MetadataEntry, MetadataKey, Reply, Term,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::EngineHandle;

/// Command accepted by the engine inbox.
///
/// Asynchronous commands carry no responder; their effects surface through
/// the acceptor queue. Synchronous commands carry a oneshot responder the
/// caller may abandon on timeout without cancelling in-engine work.
pub enum EngineCommand {
    /// Apply one committed record under the sender's current term.
    Apply {
        record: LogRecord,
        server_term: Term,
    },
    /// Execute a non-mutating command at the current applied position.
    Read {
        command: Command,
        response: oneshot::Sender<Reply>,
    },
    /// Exogenous completion of a previously-registered promise.
    Fulfill { client: ClientRef, reply: Reply },
    /// Leadership loss: resolve every pending promise with `NotLeader`.
    Cancel,
    /// Report durable progress.
    Open {
        response: oneshot::Sender<LogPosition>,
    },
    /// Create a snapshot named after the current applied position.
    SnapshotCreate {
        response: oneshot::Sender<Result<LogPosition>>,
    },
    /// Create a snapshot under an explicit directory name.
    SnapshotCreateNamed {
        name: String,
        response: oneshot::Sender<Result<()>>,
    },
    /// Install the snapshot taken at `position`, replacing live state.
    SnapshotOpen {
        position: LogPosition,
        response: oneshot::Sender<Result<()>>,
    },
    /// Best-effort removal of a snapshot directory.
    SnapshotDelete { name: String },
    /// Read a versioned metadata entry.
    ReadMetadata {
        key: MetadataKey,
        response: oneshot::Sender<Result<Option<MetadataEntry>>>,
    },
    /// Report engine and backend status items.
    Status {
        response: oneshot::Sender<Vec<(String, String)>>,
    },
    /// Close the backend and stop the worker.
    Shutdown { response: oneshot::Sender<()> },
}

/// The apply engine for one `(table, partition)` pair.
///
/// Owns the backend handle exclusively and services a serialized inbox;
/// ordering of applies, reads and control commands is exactly their arrival
/// order. An in-flight backend call delays everything behind it, which is
/// part of the consistency contract.
pub struct ApplyEngine<B: Backend> {
    config: EngineConfig,
    backend: B,
    handle: B::Handle,
    last_applied: LogPosition,
    snapshots: SnapshotStore,
    acceptor: Arc<AcceptorQueue>,
    registry: Arc<FunctionRegistry<B>>,
}

impl<B: Backend> ApplyEngine<B> {
    /// Open the backend, read its durable position, and start the worker.
    ///
    /// Returns the handle used to address the engine and the worker's join
    /// handle; the latter resolves to the termination cause and is the
    /// supervisor's restart signal.
    pub fn spawn(
        config: EngineConfig,
        backend: B,
        acceptor: Arc<AcceptorQueue>,
        registry: Arc<FunctionRegistry<B>>,
    ) -> Result<(EngineHandle, JoinHandle<Result<()>>)> {
        config.validate()?;
        std::fs::create_dir_all(&config.root_dir)?;

        let handle = backend.open(
            &config.name,
            &config.table,
            config.partition,
            &config.root_dir,
        )?;
        let last_applied = backend.position(&handle)?;
        let snapshots = SnapshotStore::new(&config.root_dir, config.max_retained_snapshots);

        info!(
            name = %config.name,
            table = %config.table,
            partition = config.partition,
            backend = backend.kind(),
            position = %last_applied,
            "partition engine starting"
        );

        let (tx, rx) = mpsc::channel(config.inbox_capacity);
        let rpc_timeout = config.rpc_timeout;
        let engine = Self {
            config,
            backend,
            handle,
            last_applied,
            snapshots,
            acceptor,
            registry,
        };
        let worker = tokio::spawn(engine.run(rx));

        Ok((EngineHandle::new(tx, rpc_timeout), worker))
    }

    /// Service the inbox until shutdown or a fatal failure.
    async fn run(mut self, mut inbox: mpsc::Receiver<EngineCommand>) -> Result<()> {
        let mut outcome = Ok(());

        while let Some(command) = inbox.recv().await {
            match command {
                EngineCommand::Apply {
                    record,
                    server_term,
                } => {
                    if let Err(e) = self.handle_apply(record, server_term) {
                        error!(name = %self.config.name, error = %e, "fatal apply failure");
                        outcome = Err(e);
                        break;
                    }
                }
                EngineCommand::Read { command, response } => {
                    observability::record_read();
                    let reply = self.execute_read(&command);
                    let _ = response.send(reply);
                }
                EngineCommand::Fulfill { client, reply } => {
                    if !self.acceptor.resolve_commit(client, reply) {
                        debug!(%client, "fulfillment for unknown promise");
                    }
                }
                EngineCommand::Cancel => {
                    let resolved = self.acceptor.cancel_all();
                    info!(name = %self.config.name, resolved, "cancelled pending waiters");
                }
                EngineCommand::Open { response } => {
                    let _ = response.send(self.last_applied);
                }
                EngineCommand::SnapshotCreate { response } => {
                    let name = snapshot_name(self.last_applied);
                    let position = self.last_applied;
                    let result = self.create_snapshot(&name).map(|_| position);
                    let _ = response.send(result);
                }
                EngineCommand::SnapshotCreateNamed { name, response } => {
                    let _ = response.send(self.create_snapshot(&name));
                }
                EngineCommand::SnapshotOpen { position, response } => {
                    let (engine, result) = self.install_snapshot(position);
                    self = engine;
                    let _ = response.send(result);
                }
                EngineCommand::SnapshotDelete { name } => {
                    self.snapshots.delete(&name);
                }
                EngineCommand::ReadMetadata { key, response } => {
                    let _ = response.send(self.backend.read_metadata(&self.handle, &key));
                }
                EngineCommand::Status { response } => {
                    let _ = response.send(self.status());
                }
                EngineCommand::Shutdown { response } => {
                    let _ = response.send(());
                    break;
                }
            }
        }

        let cause = match &outcome {
            Ok(()) => "shutdown".to_string(),
            Err(e) => e.to_string(),
        };
        self.terminate(&cause);
        outcome
    }

    /// Apply one committed record, enforcing the ordering contract.
    ///
    /// An `Err` return is fatal to the instance.
    fn handle_apply(&mut self, record: LogRecord, server_term: Term) -> Result<()> {
        self.acceptor.note_apply();

        // Re-delivery of the entry we already hold: run the delayed reads
        // again, touch nothing else.
        if record.index == self.last_applied.index {
            debug!(index = record.index, "duplicate apply delivery");
            observability::record_redelivery();
            self.drain_delayed_reads();
            return Ok(());
        }

        let expected = self.last_applied.index + 1;
        if record.index != expected {
            return Err(EngineError::OutOfOrderApply {
                expected,
                received: record.index,
            });
        }

        let position = record.position();
        let reply = match self.dispatch(&record.command, position) {
            Ok(reply) => reply,
            Err(e) => {
                // The backend failed mid-apply; this replica can no longer
                // prove it matches its peers. Deliver the failure, then stop
                // without advancing.
                if record.term == server_term {
                    self.acceptor
                        .resolve_commit(record.client, Reply::Error(e.to_string()));
                }
                return Err(EngineError::ApplyFailed {
                    position,
                    cause: e.to_string(),
                });
            }
        };

        if record.term == server_term {
            self.acceptor.resolve_commit(record.client, reply);
        } else {
            // The entry was proposed under an older leadership; its client
            // is no longer this node's responsibility.
            debug!(
                index = record.index,
                term = record.term,
                server_term,
                "dropping reply for entry from another term"
            );
        }

        self.last_applied = position;
        observability::record_apply(position.index);
        self.drain_delayed_reads();
        Ok(())
    }

    /// Dispatch one command at `position`.
    ///
    /// `Config` writes metadata, `Execute` goes through the host-function
    /// registry, everything else is backend apply. Only the backend-apply
    /// path mutates the storage handle.
    fn dispatch(&mut self, command: &Command, position: LogPosition) -> Result<Reply> {
        match command {
            Command::Config(value) => {
                self.backend
                    .write_metadata(&mut self.handle, &MetadataKey::Config, position, value)?;
                Ok(Reply::Done)
            }
            Command::Execute(call) => Ok(self.registry.invoke(&self.handle, position, call)),
            _ => self.backend.apply(command, position, &mut self.handle),
        }
    }

    /// Execute a non-mutating command at the current applied position.
    fn execute_read(&mut self, command: &Command) -> Reply {
        match self.dispatch(command, self.last_applied) {
            Ok(reply) => reply,
            Err(e) => Reply::Error(e.to_string()),
        }
    }

    /// Fire every read parked at or below the applied position.
    fn drain_delayed_reads(&mut self) {
        let due = self.acceptor.take_reads_through(self.last_applied.index);
        if due.is_empty() {
            return;
        }
        observability::record_delayed_reads(due.len());
        for (command, promise) in due {
            let reply = self.execute_read(&command);
            let _ = promise.send(reply);
        }
    }

    /// Create a snapshot under `name`, enforcing retention first.
    ///
    /// An already-existing destination directory counts as success.
    fn create_snapshot(&mut self, name: &str) -> Result<()> {
        let path = self.snapshots.root().join(name);
        if path.is_dir() {
            info!(name, "snapshot directory already exists");
            return Ok(());
        }

        self.snapshots.prune_for_create();
        self.backend.create_snapshot(&path, &self.handle)?;
        observability::record_snapshot_created();
        info!(name, position = %self.last_applied, "created snapshot");
        Ok(())
    }

    /// Install the snapshot taken at `position`, atomically replacing the
    /// storage handle and the applied position. On failure both are
    /// unchanged.
    fn install_snapshot(mut self, position: LogPosition) -> (Self, Result<()>) {
        let path = self.snapshots.path_for(position);
        if !path.is_dir() {
            return (self, Err(EngineError::SnapshotNotFound(position)));
        }

        let live = self.handle;
        match self.backend.open_snapshot(&path, position, live) {
            Ok(next) => {
                self.handle = next;
                self.last_applied = position;
                observability::record_apply(position.index);
                info!(position = %position, "installed snapshot");
                (self, Ok(()))
            }
            Err(failed) => {
                warn!(position = %position, error = %failed.error, "snapshot install failed");
                self.handle = failed.handle;
                (self, Err(failed.error))
            }
        }
    }

    /// Engine status items followed by the backend's own.
    fn status(&self) -> Vec<(String, String)> {
        let mut items = vec![
            ("name".to_string(), self.config.name.clone()),
            ("table".to_string(), self.config.table.clone()),
            ("partition".to_string(), self.config.partition.to_string()),
            ("backend".to_string(), self.backend.kind().to_string()),
            (
                "last_applied".to_string(),
                self.last_applied.index.to_string(),
            ),
            (
                "last_applied_term".to_string(),
                self.last_applied.term.to_string(),
            ),
        ];
        items.extend(self.backend.status(&self.handle));
        items
    }

    /// Close the backend and log the cause. Called exactly once, on the way
    /// out of the worker loop.
    fn terminate(self, cause: &str) {
        info!(name = %self.config.name, cause, "partition engine terminating");
        self.backend.close(self.handle);
    }
}
