//! Acceptor queue: pending client promises for one partition.
//!
//! The queue holds two kinds of waiters. Commit promises are keyed by the
//! opaque [`ClientRef`] carried in the committed record and are resolved by
//! the engine once the entry is applied. Delayed reads are keyed by the log
//! index they target and fire once the engine has applied at least that far.
//!
//! The queue has its own serialized interface (a mutex) so that producers,
//! the engine worker and the cancellation path can all touch it without
//! going through the engine inbox.

use crate::observability;
use crate::types::{ClientRef, Command, LogIndex, Reply};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;
use tracing::debug;

/// Promise half handed back to a waiting client.
pub type ReplySender = oneshot::Sender<Reply>;

#[derive(Default)]
struct Inner {
    /// Registered commits not yet consumed by an apply; a flow-control hint
    /// for producers, distinct from the promise map below.
    pending_applies: usize,
    /// Commit promises awaiting their apply, keyed by correlation token.
    commits: HashMap<ClientRef, ReplySender>,
    /// Reads parked until the engine reaches their target index.
    reads: BTreeMap<LogIndex, Vec<(Command, ReplySender)>>,
}

/// Per-partition store of pending commit and read promises.
#[derive(Default)]
pub struct AcceptorQueue {
    inner: Mutex<Inner>,
}

impl AcceptorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a commit promise for a proposed entry.
    ///
    /// A second registration under the same token replaces the first; the
    /// displaced promise is dropped and its receiver observes closure.
    pub fn register_commit(&self, client: ClientRef, promise: ReplySender) {
        let mut inner = self.inner.lock();
        if inner.commits.insert(client, promise).is_some() {
            debug!(%client, "replaced pending commit promise");
        }
        inner.pending_applies += 1;
        observability::set_pending_applies(inner.pending_applies);
    }

    /// Note that one pending-apply slot is being consumed by the engine.
    pub fn note_apply(&self) {
        let mut inner = self.inner.lock();
        inner.pending_applies = inner.pending_applies.saturating_sub(1);
        observability::set_pending_applies(inner.pending_applies);
    }

    /// Resolve the commit promise registered under `client`, if any.
    pub fn resolve_commit(&self, client: ClientRef, reply: Reply) -> bool {
        let promise = self.inner.lock().commits.remove(&client);
        match promise {
            Some(sender) => {
                let _ = sender.send(reply);
                true
            }
            None => false,
        }
    }

    /// Park a read until the engine has applied through `target`.
    pub fn park_read(&self, target: LogIndex, command: Command, promise: ReplySender) {
        let mut inner = self.inner.lock();
        inner.reads.entry(target).or_default().push((command, promise));
    }

    /// Take every parked read whose target index is at most `applied`,
    /// in ascending target order.
    pub fn take_reads_through(&self, applied: LogIndex) -> Vec<(Command, ReplySender)> {
        let mut inner = self.inner.lock();
        let drained = match applied.checked_add(1) {
            Some(bound) => {
                let keep = inner.reads.split_off(&bound);
                std::mem::replace(&mut inner.reads, keep)
            }
            None => std::mem::take(&mut inner.reads),
        };
        drained.into_values().flatten().collect()
    }

    /// Number of registered commits not yet consumed by an apply.
    pub fn pending_applies(&self) -> usize {
        self.inner.lock().pending_applies
    }

    /// Number of parked reads.
    pub fn pending_reads(&self) -> usize {
        self.inner.lock().reads.values().map(Vec::len).sum()
    }

    /// Resolve every pending promise with [`Reply::NotLeader`]: commits
    /// first, then reads in ascending target order. Idempotent and safe to
    /// call while no waiters exist. Returns how many waiters were resolved.
    pub fn cancel_all(&self) -> usize {
        let (commits, reads) = {
            let mut inner = self.inner.lock();
            let commits: Vec<ReplySender> = inner.commits.drain().map(|(_, tx)| tx).collect();
            let reads: Vec<ReplySender> = std::mem::take(&mut inner.reads)
                .into_values()
                .flatten()
                .map(|(_, tx)| tx)
                .collect();
            inner.pending_applies = 0;
            observability::set_pending_applies(0);
            (commits, reads)
        };

        let mut resolved = 0;
        for sender in commits.into_iter().chain(reads) {
            let _ = sender.send(Reply::NotLeader);
            resolved += 1;
        }
        observability::record_cancelled_waiters(resolved);
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_resolution() {
        let queue = AcceptorQueue::new();
        let client = ClientRef::new();
        let (tx, mut rx) = oneshot::channel();

        queue.register_commit(client, tx);
        assert_eq!(queue.pending_applies(), 1);

        queue.note_apply();
        assert_eq!(queue.pending_applies(), 0);

        assert!(queue.resolve_commit(client, Reply::Done));
        assert_eq!(rx.try_recv().unwrap(), Reply::Done);

        // Already resolved; nothing left under this token.
        assert!(!queue.resolve_commit(client, Reply::Done));
    }

    #[test]
    fn test_reads_drain_in_target_order() {
        let queue = AcceptorQueue::new();
        let (tx3, _rx3) = oneshot::channel();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        queue.park_read(3, Command::Noop, tx3);
        queue.park_read(1, Command::User(vec![1]), tx1);
        queue.park_read(2, Command::User(vec![2]), tx2);

        let drained = queue.take_reads_through(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, Command::User(vec![1]));
        assert_eq!(drained[1].0, Command::User(vec![2]));
        assert_eq!(queue.pending_reads(), 1);

        // The remaining read fires once the engine catches up.
        let rest = queue.take_reads_through(5);
        assert_eq!(rest.len(), 1);
        assert_eq!(queue.pending_reads(), 0);
    }

    #[test]
    fn test_cancel_resolves_everything_with_not_leader() {
        let queue = AcceptorQueue::new();
        let (c1, mut r1) = oneshot::channel();
        let (c2, mut r2) = oneshot::channel();
        let (q1, mut p1) = oneshot::channel();

        queue.register_commit(ClientRef::new(), c1);
        queue.register_commit(ClientRef::new(), c2);
        queue.park_read(10, Command::Noop, q1);

        assert_eq!(queue.cancel_all(), 3);
        assert_eq!(r1.try_recv().unwrap(), Reply::NotLeader);
        assert_eq!(r2.try_recv().unwrap(), Reply::NotLeader);
        assert_eq!(p1.try_recv().unwrap(), Reply::NotLeader);

        // Idempotent on an empty queue.
        assert_eq!(queue.cancel_all(), 0);
    }
}
