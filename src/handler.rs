//! Per-connection request handling: binds one client to the transaction
//! executor, the monitor engine, and the lock manager, and routes RPC
//! method names to them.

use crate::db::{Database, Locker};
use crate::error::OvsdbError;
use crate::monitor::{DbMonitor, MonitorData, MonitorRegistry, Notifier, Updater};
use crate::protocol::{
    CondMonitorParameters, Dialect, TableUpdate, TableUpdates, TransactRequest, ZERO_UUID,
    json_value_key,
};
use crate::storage::keyspace::Key;
use crate::txn::Transaction;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

pub struct Handler {
    db: Arc<Database>,
    notifier: Arc<dyn Notifier>,
    client: String,
    closed: AtomicBool,
    monitors: Mutex<HashMap<String, DbMonitor>>,
    registry: MonitorRegistry,
    locks: Mutex<HashMap<String, Arc<Locker>>>,
}

impl Handler {
    pub fn new(db: Arc<Database>, notifier: Arc<dyn Notifier>, client: &str) -> Handler {
        Handler {
            db,
            notifier,
            client: client.to_string(),
            closed: AtomicBool::new(false),
            monitors: Mutex::new(HashMap::new()),
            registry: Arc::new(Mutex::new(HashMap::new())),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one RPC by method name.
    pub async fn dispatch(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, OvsdbError> {
        debug!(client = %self.client, method, "request");
        match method {
            "transact" => self.transact(params).await,
            "cancel" => Ok(json!({})),
            "monitor" => self.monitor(params, Dialect::Update).await,
            "monitor_cond" => self.monitor(params, Dialect::Update2).await,
            "monitor_cond_since" => {
                let data = self.monitor(params, Dialect::Update3).await?;
                Ok(json!([false, ZERO_UUID, data]))
            }
            // condition replacement is accepted but has no defined semantics
            "monitor_cond_change" => Ok(json!({})),
            "monitor_cancel" => {
                self.remove_monitor(&params, true).await?;
                Ok(json!({}))
            }
            "lock" => self.lock(params).await,
            "steal" => Err(OvsdbError::NotSupported("steal".into())),
            "unlock" => self.unlock(params).await,
            "set_db_change_aware" => Ok(json!({})),
            // RFC 7047 section 4.1.11: result is the params, verbatim
            "echo" => Ok(params),
            other => Err(OvsdbError::NotSupported(format!("method {other}"))),
        }
    }

    async fn transact(&self, params: serde_json::Value) -> Result<serde_json::Value, OvsdbError> {
        if self.closed.load(Ordering::Acquire) {
            // prevents transactions racing connection teardown
            return Ok(serde_json::Value::Null);
        }
        let request = TransactRequest::from_params(&params)?;
        let schema = self.db.schema(&request.db_name)?;
        let db_name = request.db_name.clone();
        let mut txn = Transaction::new(self.db.kv(), self.db.kv_timeout(), schema, request);
        let guard = self.db.commit_guard(&db_name).await;
        let outcome = txn.commit().await;
        drop(guard);
        match outcome {
            Ok(revision) => {
                debug!(client = %self.client, db = %db_name, revision, "transact done");
                serde_json::to_value(&txn.results)
                    .map_err(|e| OvsdbError::Internal(e.to_string()))
            }
            Err(err) => {
                warn!(client = %self.client, db = %db_name, %err, "transact failed");
                Err(err)
            }
        }
    }

    async fn monitor(
        &self,
        params: serde_json::Value,
        dialect: Dialect,
    ) -> Result<serde_json::Value, OvsdbError> {
        let parsed = CondMonitorParameters::from_params(&params)?;
        let json_value = parsed.json_value.clone();
        let updaters_map = self.add_monitor(parsed, dialect).await?;
        match self.initial_snapshot(&updaters_map).await {
            Ok(data) => {
                serde_json::to_value(&data).map_err(|e| OvsdbError::Internal(e.to_string()))
            }
            Err(err) => {
                // roll the half-registered monitor back, without notifying
                let _ = self.remove_monitor(&json_value, false).await;
                Err(err)
            }
        }
    }

    async fn add_monitor(
        &self,
        parsed: CondMonitorParameters,
        dialect: Dialect,
    ) -> Result<HashMap<String, Vec<Updater>>, OvsdbError> {
        if parsed.db_name.is_empty() {
            return Err(OvsdbError::Ovsdb("monitored database name is empty".into()));
        }
        let schema = self.db.schema(&parsed.db_name)?;
        let key = json_value_key(&parsed.json_value);
        if self.registry.lock().contains_key(&key) {
            return Err(OvsdbError::Ovsdb("duplicate monitor ID".into()));
        }

        let mut updaters_map: HashMap<String, Vec<Updater>> = HashMap::new();
        let mut updater_keys = Vec::new();
        for (table, requests) in &parsed.requests {
            schema.lookup_table(table)?;
            let table_key = Key::table(&parsed.db_name, table).to_string();
            let updaters = requests
                .iter()
                .map(|request| Updater::new(Arc::clone(&schema), table, request, &key, dialect))
                .collect();
            updaters_map.insert(table_key.clone(), updaters);
            updater_keys.push(table_key);
        }

        if !self.monitors.lock().contains_key(&parsed.db_name) {
            let events = self.db.watch_db(&parsed.db_name).await;
            let mut monitor = DbMonitor::new(&parsed.db_name);
            monitor.start(
                events,
                Arc::clone(&self.notifier),
                Arc::clone(&self.registry),
            );
            self.monitors
                .lock()
                .entry(parsed.db_name.clone())
                .or_insert(monitor);
        }
        if let Some(monitor) = self.monitors.lock().get(&parsed.db_name) {
            monitor.add_updaters(updaters_map.clone());
        }
        self.registry.lock().insert(
            key,
            MonitorData {
                db_name: parsed.db_name.clone(),
                dialect,
                json_value: parsed.json_value,
                updater_keys,
            },
        );
        info!(client = %self.client, db = %parsed.db_name, "monitor added");
        Ok(updaters_map)
    }

    /// Reads each monitored table once and formats the initial rows.
    async fn initial_snapshot(
        &self,
        updaters_map: &HashMap<String, Vec<Updater>>,
    ) -> Result<TableUpdates, OvsdbError> {
        let mut out = TableUpdates::new();
        for (table_key, updaters) in updaters_map {
            if !updaters.iter().any(Updater::wants_initial) {
                continue;
            }
            let pairs = self.db.get_prefix(table_key).await?;
            let mut table_update = TableUpdate::new();
            let mut table_name = String::new();
            for pair in pairs {
                let Some((_, table, uuid)) = Key::parse_data(&pair.key) else {
                    continue;
                };
                table_name = table.to_string();
                let row = crate::catalog::types::row_from_json(&pair.value)
                    .map_err(|e| OvsdbError::Internal(format!("undecodable row: {e}")))?;
                for updater in updaters {
                    if let Some(row_update) = updater.initial_row(&row)? {
                        table_update.insert(uuid.to_string(), row_update);
                    }
                }
            }
            if !table_update.is_empty() {
                out.insert(table_name, table_update);
            }
        }
        Ok(out)
    }

    async fn remove_monitor(
        &self,
        json_value: &serde_json::Value,
        notify: bool,
    ) -> Result<(), OvsdbError> {
        let key = json_value_key(json_value);
        let data = self
            .registry
            .lock()
            .remove(&key)
            .ok_or_else(|| OvsdbError::Ovsdb("unknown monitor".into()))?;
        {
            let mut monitors = self.monitors.lock();
            match monitors.get(&data.db_name) {
                Some(monitor) => {
                    monitor.remove_updaters(&data.updater_keys, &key);
                    if !monitor.has_updaters() {
                        // dropping the monitor cancels its watch task
                        monitors.remove(&data.db_name);
                    }
                }
                None => warn!(db = %data.db_name, "no monitor registered for database"),
            }
        }
        if notify
            && let Err(err) = self
                .notifier
                .notify("monitor_canceled", json_value.clone())
                .await
        {
            error!(client = %self.client, %err, "monitor_canceled notification failed");
        }
        Ok(())
    }

    async fn lock(&self, params: serde_json::Value) -> Result<serde_json::Value, OvsdbError> {
        let id = params_to_string(&params)?;
        let existing = { self.locks.lock().get(&id).cloned() };
        let locker = match existing {
            Some(locker) => locker,
            None => {
                let fresh = Arc::new(self.db.get_lock(&id).await?);
                let raced = {
                    let mut locks = self.locks.lock();
                    match locks.get(&id) {
                        // lost a race against ourselves; keep the first locker
                        Some(raced) => Some(Arc::clone(raced)),
                        None => {
                            locks.insert(id.clone(), Arc::clone(&fresh));
                            None
                        }
                    }
                };
                match raced {
                    Some(raced) => {
                        fresh.cancel().await;
                        raced
                    }
                    None => fresh,
                }
            }
        };

        if locker.try_lock().await? {
            debug!(client = %self.client, id, "locked");
            return Ok(json!({"locked": true}));
        }

        // contended: answer immediately and acquire in the background
        let mutex = locker.mutex_handle();
        let notifier = Arc::clone(&self.notifier);
        let client = self.client.clone();
        let lock_id = id.clone();
        locker.set_acquirer(tokio::spawn(async move {
            match mutex.lock().await {
                Ok(()) => {
                    debug!(client = %client, id = %lock_id, "lock acquired");
                    if let Err(err) = notifier.notify("locked", json!([lock_id])).await {
                        error!(client = %client, %err, "locked notification failed");
                    }
                }
                Err(err) => error!(client = %client, id = %lock_id, %err, "lock wait failed"),
            }
        }));
        Ok(json!({"locked": false}))
    }

    async fn unlock(&self, params: serde_json::Value) -> Result<serde_json::Value, OvsdbError> {
        let id = params_to_string(&params)?;
        let locker = self.locks.lock().remove(&id);
        match locker {
            Some(locker) => locker.cancel().await,
            None => debug!(client = %self.client, id, "unlock of unknown lock"),
        }
        Ok(json!({}))
    }

    /// Releases every lock and monitor this connection owns.
    pub async fn cleanup(&self) {
        info!(client = %self.client, "handler cleanup");
        self.closed.store(true, Ordering::Release);
        let lockers: Vec<Arc<Locker>> = self.locks.lock().drain().map(|(_, l)| l).collect();
        for locker in lockers {
            locker.cancel().await;
        }
        // dropping the monitors aborts their watch tasks
        self.monitors.lock().drain();
        self.registry.lock().clear();
    }

    pub fn client_address(&self) -> &str {
        &self.client
    }
}

fn params_to_string(params: &serde_json::Value) -> Result<String, OvsdbError> {
    let text = match params {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Array(items) if items.len() == 1 => items[0].as_str(),
        _ => None,
    };
    text.map(str::to_string)
        .ok_or_else(|| OvsdbError::Ovsdb(format!("expected a single string parameter: {params}")))
}
