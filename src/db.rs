use crate::catalog::Schemas;
use crate::catalog::schema::DatabaseSchema;
use crate::catalog::types::{Atom, Row, Value, row_to_json, set_row_uuid, set_row_version};
use crate::config::OvskvConfig;
use crate::error::OvsdbError;
use crate::storage::keyspace::Key;
use crate::storage::kv::{KvMutex, KvPair, KvSession, KvStore, WatchReceiver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// Table carrying the server's self-description rows.
const SERVER_DB: &str = "_Server";
const SERVER_TABLE: &str = "Database";

/// Shared server-side state: the KV client, the schema registry, and the
/// per-database commit mutexes that serialise transactions.
pub struct Database {
    kv: Arc<dyn KvStore>,
    config: OvskvConfig,
    schemas: Schemas,
    commit_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Database {
    pub fn new(kv: Arc<dyn KvStore>, config: OvskvConfig) -> Result<Arc<Database>, OvsdbError> {
        config.validate()?;
        Ok(Arc::new(Database {
            kv,
            config,
            schemas: Schemas::default(),
            commit_locks: Mutex::new(HashMap::new()),
        }))
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    pub fn kv_timeout(&self) -> Duration {
        self.config.kv_call_timeout
    }

    /// Registers a schema and writes its `_Server/Database/<name>` record.
    pub async fn add_schema(&self, text: &str) -> Result<Arc<DatabaseSchema>, OvsdbError> {
        let schema = self.schemas.add_from_text(text)?;
        info!(db = %schema.name, tables = schema.tables.len(), "registered schema");

        let mut record = Row::new();
        record.insert("name".to_string(), Value::string(schema.name.clone()));
        record.insert("model".to_string(), Value::string("standalone"));
        record.insert("connected".to_string(), Value::boolean(true));
        record.insert("leader".to_string(), Value::boolean(true));
        record.insert(
            "schema".to_string(),
            Value::Set(vec![Atom::String(text.to_string())]),
        );
        set_row_uuid(&mut record, Uuid::new_v4());
        set_row_version(&mut record);
        let key = Key::data(SERVER_DB, SERVER_TABLE, &schema.name).to_string();
        let value = row_to_json(&record).map_err(OvsdbError::Internal)?;
        self.with_deadline(self.kv.put(&key, &value)).await?;
        Ok(schema)
    }

    pub fn schema(&self, db_name: &str) -> Result<Arc<DatabaseSchema>, OvsdbError> {
        self.schemas.get(db_name)
    }

    pub fn database_names(&self) -> Vec<String> {
        self.schemas.names()
    }

    /// The process-level mutex serialising commits to one database.
    pub async fn commit_guard(&self, db_name: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.commit_locks.lock();
            Arc::clone(
                locks
                    .entry(db_name.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>, OvsdbError> {
        self.with_deadline(self.kv.get_prefix(prefix)).await
    }

    pub async fn watch_db(&self, db_name: &str) -> WatchReceiver {
        self.kv.watch_prefix(&Key::db(db_name).to_string()).await
    }

    /// Opens a fresh KV session and binds a distributed mutex for `id`.
    pub async fn get_lock(&self, id: &str) -> Result<Locker, OvsdbError> {
        let session = self.with_deadline(self.kv.lock_session()).await?;
        let mutex = session.mutex(&Key::lock(id).to_string());
        Ok(Locker {
            session,
            mutex,
            acquirer: Mutex::new(None),
        })
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, OvsdbError>>,
    ) -> Result<T, OvsdbError> {
        tokio::time::timeout(self.config.kv_call_timeout, call)
            .await
            .map_err(|_| OvsdbError::Io("kv call deadline exceeded".into()))?
    }
}

/// One held (or wanted) distributed mutex: a dedicated KV session, the
/// mutex bound to the lock key, and the background acquirer's handle.
pub struct Locker {
    session: Arc<dyn KvSession>,
    mutex: Arc<dyn KvMutex>,
    acquirer: Mutex<Option<JoinHandle<()>>>,
}

impl Locker {
    pub async fn try_lock(&self) -> Result<bool, OvsdbError> {
        self.mutex.try_lock().await
    }

    pub fn mutex_handle(&self) -> Arc<dyn KvMutex> {
        Arc::clone(&self.mutex)
    }

    pub fn set_acquirer(&self, handle: JoinHandle<()>) {
        *self.acquirer.lock() = Some(handle);
    }

    /// Stops any pending acquirer and closes the session, which releases
    /// the mutex if held.
    pub async fn cancel(&self) {
        if let Some(handle) = self.acquirer.lock().take() {
            handle.abort();
        }
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::config::OvskvConfig;
    use crate::storage::kv::KvStore;
    use crate::storage::mem::MemKv;
    use std::sync::Arc;

    const SCHEMA: &str = r#"{
        "name": "tiny",
        "tables": {"T": {"columns": {"c": {"type": "string"}}}}
    }"#;

    #[tokio::test]
    async fn add_schema_writes_the_server_record() {
        let kv = Arc::new(MemKv::new());
        let db = Database::new(kv.clone(), OvskvConfig::default()).expect("db");
        db.add_schema(SCHEMA).await.expect("schema");
        assert!(db.schema("tiny").is_ok());

        let rows = kv
            .get_prefix("ovsdb/_Server/Database/")
            .await
            .expect("get");
        assert_eq!(rows.len(), 1);
        let record: serde_json::Value =
            serde_json::from_str(&rows[0].value).expect("record json");
        assert_eq!(record["model"], "standalone");
        assert_eq!(record["connected"], true);
        assert_eq!(record["leader"], true);
        assert_eq!(record["name"], "tiny");
        assert_eq!(record["schema"][0], "set");
    }

    #[tokio::test]
    async fn commit_guard_serialises_per_database() {
        let kv = Arc::new(MemKv::new());
        let db = Database::new(kv, OvskvConfig::default()).expect("db");
        let guard = db.commit_guard("a").await;
        // a different database is an independent mutex
        let _other = db.commit_guard("b").await;
        drop(guard);
        let _again = db.commit_guard("a").await;
    }
}
