//! In-memory KV engine implementing the full [`KvStore`] contract.
//!
//! Behaves like a single-node etcd as far as this server can observe:
//! monotonically increasing revisions, one revision per committed
//! transaction, rejection of two writes to the same key inside one `Then`
//! branch, prefix watches with previous-value capture, and session-scoped
//! named mutexes handed off in FIFO order. Integration tests run against
//! this engine.

use crate::error::OvsdbError;
use crate::storage::kv::{
    KvCompare, KvMutex, KvOp, KvPair, KvSession, KvStore, KvTxn, KvTxnResponse, WatchEvent,
    WatchEventKind, WatchReceiver,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    mod_revision: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<WatchEvent>>,
}

#[derive(Default)]
struct LockState {
    holder: Option<u64>,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
}

#[derive(Default)]
struct SessionState {
    held: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    revision: i64,
    watchers: Vec<Watcher>,
    locks: BTreeMap<String, LockState>,
    sessions: BTreeMap<u64, SessionState>,
    next_session_id: u64,
}

impl State {
    fn range(&self, prefix: &str) -> Vec<KvPair> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KvPair {
                key: k.clone(),
                value: e.value.clone(),
                mod_revision: e.mod_revision,
            })
            .collect()
    }

    fn release_lock(&mut self, name: &str) {
        loop {
            let granted = {
                let Some(lock) = self.locks.get_mut(name) else {
                    return;
                };
                lock.holder = None;
                let Some((waiter, tx)) = lock.waiters.pop_front() else {
                    return;
                };
                // a waiter that went away before the grant is skipped
                if tx.send(()).is_ok() {
                    lock.holder = Some(waiter);
                    Some(waiter)
                } else {
                    None
                }
            };
            if let Some(waiter) = granted {
                self.sessions
                    .entry(waiter)
                    .or_default()
                    .held
                    .insert(name.to_string());
                return;
            }
        }
    }
}

/// Shared in-memory store; `Clone` shares the same state.
#[derive(Clone, Default)]
pub struct MemKv {
    state: Arc<Mutex<State>>,
}

impl MemKv {
    pub fn new() -> MemKv {
        MemKv::default()
    }

    /// Current store revision; test helper.
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    fn apply(&self, txn: KvTxn) -> Result<KvTxnResponse, OvsdbError> {
        let mut state = self.state.lock();
        let succeeded = txn.compare.iter().all(|cmp| match cmp {
            KvCompare::ModRevisionEq { key, revision } => {
                state.entries.get(key).map(|e| e.mod_revision).unwrap_or(0) == *revision
            }
        });
        let branch = if succeeded { &txn.then } else { &txn.otherwise };

        // etcd forbids touching the same key twice with writes in one branch
        let mut write_keys = BTreeSet::new();
        for op in branch {
            if op.is_write() && !write_keys.insert(op.key().to_string()) {
                return Err(OvsdbError::Io(format!(
                    "duplicate key given in txn request: {}",
                    op.key()
                )));
            }
        }

        let has_write = branch.iter().any(KvOp::is_write);
        let revision = if has_write {
            state.revision += 1;
            state.revision
        } else {
            state.revision
        };

        let mut ranges = Vec::new();
        let mut events = Vec::new();
        for op in branch {
            match op {
                KvOp::Get { prefix } => ranges.push(state.range(prefix)),
                KvOp::Put { key, value } => {
                    let prev = state.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            mod_revision: revision,
                        },
                    );
                    events.push(WatchEvent {
                        kind: WatchEventKind::Put,
                        key: key.clone(),
                        value: Some(value.clone()),
                        prev_value: prev.map(|e| e.value),
                        revision,
                    });
                }
                KvOp::Delete { key } => {
                    if let Some(prev) = state.entries.remove(key) {
                        events.push(WatchEvent {
                            kind: WatchEventKind::Delete,
                            key: key.clone(),
                            value: None,
                            prev_value: Some(prev.value),
                            revision,
                        });
                    }
                }
            }
        }

        if !events.is_empty() {
            debug!(revision, events = events.len(), "kv commit");
            state.watchers.retain(|w| {
                let batch: Vec<WatchEvent> = events
                    .iter()
                    .filter(|e| e.key.starts_with(&w.prefix))
                    .cloned()
                    .collect();
                if batch.is_empty() {
                    true
                } else {
                    w.tx.send(batch).is_ok()
                }
            });
        }

        Ok(KvTxnResponse {
            succeeded,
            revision,
            ranges,
        })
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, OvsdbError> {
        Ok(self.state.lock().range(prefix))
    }

    async fn commit(&self, txn: KvTxn) -> Result<KvTxnResponse, OvsdbError> {
        self.apply(txn)
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64, OvsdbError> {
        let resp = self.apply(KvTxn {
            then: vec![KvOp::Put {
                key: key.to_string(),
                value: value.to_string(),
            }],
            ..KvTxn::default()
        })?;
        Ok(resp.revision)
    }

    async fn watch_prefix(&self, prefix: &str) -> WatchReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }

    async fn lock_session(&self) -> Result<Arc<dyn KvSession>, OvsdbError> {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_session_id;
            state.next_session_id += 1;
            state.sessions.insert(id, SessionState::default());
            id
        };
        Ok(Arc::new(MemSession {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemSession {
    id: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl KvSession for MemSession {
    fn mutex(&self, name: &str) -> Arc<dyn KvMutex> {
        Arc::new(MemMutex {
            name: name.to_string(),
            session: self.id,
            state: Arc::clone(&self.state),
        })
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        for lock in state.locks.values_mut() {
            lock.waiters.retain(|(waiter, _)| *waiter != self.id);
        }
        let held = state
            .sessions
            .remove(&self.id)
            .map(|s| s.held)
            .unwrap_or_default();
        for name in held {
            state.release_lock(&name);
        }
    }
}

struct MemMutex {
    name: String,
    session: u64,
    state: Arc<Mutex<State>>,
}

impl MemMutex {
    /// Fast-path acquire under the state lock; `None` means contended.
    fn acquire_if_free(&self) -> Option<bool> {
        let mut state = self.state.lock();
        let lock = state.locks.entry(self.name.clone()).or_default();
        match lock.holder {
            None => {
                lock.holder = Some(self.session);
                state
                    .sessions
                    .entry(self.session)
                    .or_default()
                    .held
                    .insert(self.name.clone());
                Some(true)
            }
            Some(holder) if holder == self.session => Some(true),
            Some(_) => None,
        }
    }
}

#[async_trait]
impl KvMutex for MemMutex {
    async fn try_lock(&self) -> Result<bool, OvsdbError> {
        Ok(self.acquire_if_free().unwrap_or(false))
    }

    async fn lock(&self) -> Result<(), OvsdbError> {
        if self.acquire_if_free().is_some() {
            return Ok(());
        }
        let rx = {
            let mut state = self.state.lock();
            let lock = state.locks.entry(self.name.clone()).or_default();
            if lock.holder.is_none() {
                lock.holder = Some(self.session);
                state
                    .sessions
                    .entry(self.session)
                    .or_default()
                    .held
                    .insert(self.name.clone());
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            lock.waiters.push_back((self.session, tx));
            rx
        };
        rx.await
            .map_err(|_| OvsdbError::Io("lock session closed while waiting".into()))
    }

    async fn unlock(&self) -> Result<(), OvsdbError> {
        let mut state = self.state.lock();
        let holds = state
            .locks
            .get(&self.name)
            .is_some_and(|l| l.holder == Some(self.session));
        if holds {
            if let Some(session) = state.sessions.get_mut(&self.session) {
                session.held.remove(&self.name);
            }
            state.release_lock(&self.name);
        }
        Ok(())
    }
}
