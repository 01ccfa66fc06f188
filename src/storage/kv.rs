//! The seam between this server and the external KV store.
//!
//! The store is assumed to be an etcd-like MVCC service: prefix range reads,
//! multi-op conditional transactions, range watches with previous-value
//! capture, and session-scoped named mutexes. Everything above this module
//! talks to the trait, never to a concrete client.

use crate::error::OvsdbError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One stored key/value with the revision that last modified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Range read of every key under `prefix`.
    Get { prefix: String },
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvOp {
    /// The key (or prefix) this op addresses; write dedup keys off this.
    pub fn key(&self) -> &str {
        match self {
            KvOp::Get { prefix } => prefix,
            KvOp::Put { key, .. } => key,
            KvOp::Delete { key } => key,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, KvOp::Put { .. } | KvOp::Delete { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvCompare {
    ModRevisionEq { key: String, revision: i64 },
}

/// An ordered multi-op transaction: if every compare holds, `then` runs,
/// otherwise `otherwise`. The whole executed branch is atomic at one
/// revision.
#[derive(Debug, Clone, Default)]
pub struct KvTxn {
    pub compare: Vec<KvCompare>,
    pub then: Vec<KvOp>,
    pub otherwise: Vec<KvOp>,
}

impl KvTxn {
    pub fn clear(&mut self) {
        self.compare.clear();
        self.then.clear();
        self.otherwise.clear();
    }
}

/// Transaction response: `ranges` holds one entry per `Get` in the executed
/// branch, in op order.
#[derive(Debug, Clone, Default)]
pub struct KvTxnResponse {
    pub succeeded: bool,
    pub revision: i64,
    pub ranges: Vec<Vec<KvPair>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single watch event with previous-value capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
    pub value: Option<String>,
    pub prev_value: Option<String>,
    pub revision: i64,
}

/// Batches of events as delivered per committed revision. Dropping the
/// receiver cancels the watch.
pub type WatchReceiver = mpsc::UnboundedReceiver<Vec<WatchEvent>>;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, OvsdbError>;

    async fn commit(&self, txn: KvTxn) -> Result<KvTxnResponse, OvsdbError>;

    async fn put(&self, key: &str, value: &str) -> Result<i64, OvsdbError>;

    /// Opens a range watch over `prefix`, with previous values attached to
    /// every event.
    async fn watch_prefix(&self, prefix: &str) -> WatchReceiver;

    /// Opens a session for distributed mutexes. Closing the session releases
    /// everything acquired through it.
    async fn lock_session(&self) -> Result<Arc<dyn KvSession>, OvsdbError>;
}

#[async_trait]
pub trait KvSession: Send + Sync {
    fn mutex(&self, name: &str) -> Arc<dyn KvMutex>;

    async fn close(&self);
}

#[async_trait]
pub trait KvMutex: Send + Sync {
    /// Non-blocking acquire; `Ok(false)` when another session holds it.
    async fn try_lock(&self) -> Result<bool, OvsdbError>;

    /// Blocks until the mutex is granted to this session.
    async fn lock(&self) -> Result<(), OvsdbError>;

    async fn unlock(&self) -> Result<(), OvsdbError>;
}
