//! Async client handle for one engine instance.

use crate::acceptor::ReplySender;
use crate::error::{EngineError, Result};
use crate::types::{
    ClientRef, Command, LogPosition, LogRecord, MetadataEntry, MetadataKey, Reply, Term,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::worker::EngineCommand;

/// Addresses a running [`ApplyEngine`](super::ApplyEngine) through its
/// serialized inbox.
///
/// Cloneable and cheap; all clones feed the same worker. Synchronous
/// operations carry a caller-side timeout; expiring abandons the response,
/// it does not cancel the in-engine work.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    rpc_timeout: Duration,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<EngineCommand>, rpc_timeout: Duration) -> Self {
        Self { tx, rpc_timeout }
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(EngineError::EngineStopped),
            Err(_) => Err(EngineError::Timeout(self.rpc_timeout.as_millis() as u64)),
        }
    }

    /// Report durable progress. Called by the consensus layer after start.
    pub async fn open(&self) -> Result<LogPosition> {
        self.request(|response| EngineCommand::Open { response }).await
    }

    /// Enqueue one committed record for application. Asynchronous: the
    /// client reply travels through the acceptor queue, not this call.
    pub async fn apply(&self, record: LogRecord, server_term: Term) -> Result<()> {
        self.send(EngineCommand::Apply {
            record,
            server_term,
        })
        .await
    }

    /// Execute a non-mutating command at the current applied position and
    /// wait for its reply. No timeout: an in-flight apply may delay the
    /// read arbitrarily, which is part of the consistency contract.
    pub async fn read(&self, command: Command) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.read_to(tx, command).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// Dispatch a read whose reply goes to a caller-provided promise.
    pub async fn read_to(&self, from: ReplySender, command: Command) -> Result<()> {
        self.send(EngineCommand::Read {
            command,
            response: from,
        })
        .await
    }

    /// Resolve a previously-registered promise with an exogenous reply.
    pub async fn fulfill(&self, client: ClientRef, reply: Reply) -> Result<()> {
        self.send(EngineCommand::Fulfill { client, reply }).await
    }

    /// Leadership loss: resolve every pending promise with `NotLeader`.
    pub async fn cancel(&self) -> Result<()> {
        self.send(EngineCommand::Cancel).await
    }

    /// Create a snapshot named after the current applied position and
    /// return that position.
    pub async fn create_snapshot(&self) -> Result<LogPosition> {
        self.request(|response| EngineCommand::SnapshotCreate { response })
            .await?
    }

    /// Create a snapshot under an explicit directory name.
    pub async fn create_snapshot_named(&self, name: impl Into<String>) -> Result<()> {
        self.request(|response| EngineCommand::SnapshotCreateNamed {
            name: name.into(),
            response,
        })
        .await?
    }

    /// Install the snapshot taken at `position`, replacing live state.
    pub async fn open_snapshot(&self, position: LogPosition) -> Result<()> {
        self.request(|response| EngineCommand::SnapshotOpen { position, response })
            .await?
    }

    /// Best-effort removal of a snapshot directory. Fire-and-forget.
    pub async fn delete_snapshot(&self, name: impl Into<String>) -> Result<()> {
        self.send(EngineCommand::SnapshotDelete { name: name.into() })
            .await
    }

    /// Read a versioned metadata entry. Uncached.
    pub async fn read_metadata(&self, key: MetadataKey) -> Result<Option<MetadataEntry>> {
        self.request(|response| EngineCommand::ReadMetadata { key, response })
            .await?
    }

    /// Engine and backend status items.
    pub async fn status(&self) -> Result<Vec<(String, String)>> {
        self.request(|response| EngineCommand::Status { response })
            .await
    }

    /// Close the backend and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response| EngineCommand::Shutdown { response })
            .await
    }
}
