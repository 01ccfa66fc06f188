//! OVSDB-compatible transactional database core backed by an external
//! MVCC key-value store.
//!
//! The crate implements the server side of the OVSDB protocol above an
//! etcd-like KV client ([`storage::kv::KvStore`]): multi-operation
//! transactions with named-UUID resolution and schema validation, row-change
//! monitors driven by KV range watches, and distributed per-resource locks.
//! The JSON-RPC transport and the concrete KV client live outside this
//! crate, behind the [`monitor::Notifier`] and [`storage::kv::KvStore`]
//! seams.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod monitor;
pub mod protocol;
pub mod storage;
pub mod txn;

pub use crate::config::OvskvConfig;
pub use crate::db::Database;
pub use crate::error::OvsdbError;
pub use crate::handler::Handler;
pub use crate::monitor::Notifier;
pub use crate::storage::mem::MemKv;
