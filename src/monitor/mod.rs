//! Row-change monitors: one KV prefix watcher per database, fanned out to
//! per-subscription updaters that filter, project, and format
//! `update`/`update2`/`update3` payloads.

use crate::catalog::schema::DatabaseSchema;
use crate::catalog::types::{COL_UUID, COL_VERSION, Row, row_from_json};
use crate::error::OvsdbError;
use crate::protocol::{
    Dialect, JsonMap, MonitorCondRequest, MonitorSelect, RowUpdate, TableUpdates, ZERO_UUID,
};
use crate::storage::keyspace::Key;
use crate::storage::kv::{WatchEvent, WatchReceiver};
use crate::txn::condition::row_matches_where;
use crate::txn::resolver::NamedUuidResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Everything the dispatcher needs to address one subscription.
#[derive(Debug, Clone)]
pub struct MonitorData {
    pub db_name: String,
    pub dialect: Dialect,
    pub json_value: serde_json::Value,
    pub updater_keys: Vec<String>,
}

/// Handler-owned registry of subscriptions, shared with the watch task.
pub type MonitorRegistry = Arc<Mutex<HashMap<String, MonitorData>>>;

/// The transport half used for outbound notifications.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), OvsdbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Insert,
    Modify,
    Delete,
}

/// Per-table, per-subscription filter and projection.
#[derive(Clone)]
pub struct Updater {
    pub json_value_key: String,
    pub table: String,
    columns: Option<Vec<String>>,
    where_: Option<Vec<serde_json::Value>>,
    select: MonitorSelect,
    dialect: Dialect,
    schema: Arc<DatabaseSchema>,
}

impl Updater {
    pub fn new(
        schema: Arc<DatabaseSchema>,
        table: &str,
        request: &MonitorCondRequest,
        json_value_key: &str,
        dialect: Dialect,
    ) -> Updater {
        Updater {
            json_value_key: json_value_key.to_string(),
            table: table.to_string(),
            columns: request.columns.clone(),
            where_: request.where_.clone(),
            select: request.select.unwrap_or_default(),
            dialect,
            schema,
        }
    }

    pub fn wants_initial(&self) -> bool {
        self.select.initial()
    }

    /// Formats one row of the initial snapshot; `None` when the updater did
    /// not ask for initial rows or its condition rejects the row.
    pub fn initial_row(&self, row: &Row) -> Result<Option<RowUpdate>, OvsdbError> {
        if !self.select.initial() {
            return Ok(None);
        }
        if !self.row_selected(row)? {
            return Ok(None);
        }
        let projected = self.project(row);
        Ok(Some(match self.dialect {
            Dialect::Update => RowUpdate {
                new: Some(projected),
                ..RowUpdate::default()
            },
            Dialect::Update2 | Dialect::Update3 => RowUpdate {
                initial: Some(projected),
                ..RowUpdate::default()
            },
        }))
    }

    /// Classifies and formats one watch event; `None` when the event is
    /// filtered out by select flags, the condition, or an empty diff.
    pub fn format_event(&self, event: &WatchEvent) -> Result<Option<RowUpdate>, OvsdbError> {
        let new = decode_optional_row(event.value.as_deref())?;
        let old = decode_optional_row(event.prev_value.as_deref())?;
        let kind = match (&old, &new) {
            (None, Some(_)) => EventKind::Insert,
            (Some(_), Some(_)) => EventKind::Modify,
            (Some(_), None) => EventKind::Delete,
            (None, None) => return Ok(None),
        };
        let wanted = match kind {
            EventKind::Insert => self.select.insert(),
            EventKind::Modify => self.select.modify(),
            EventKind::Delete => self.select.delete(),
        };
        if !wanted {
            return Ok(None);
        }
        // the condition applies to the row's surviving state; for deletes
        // that is the prior state
        let subject = match kind {
            EventKind::Delete => old.as_ref().expect("delete carries a previous value"),
            _ => new.as_ref().expect("insert/modify carries a value"),
        };
        if !self.row_selected(subject)? {
            return Ok(None);
        }

        Ok(match kind {
            EventKind::Insert => {
                let projected = self.project(new.as_ref().expect("insert row"));
                Some(match self.dialect {
                    Dialect::Update => RowUpdate {
                        new: Some(projected),
                        ..RowUpdate::default()
                    },
                    _ => RowUpdate {
                        insert: Some(projected),
                        ..RowUpdate::default()
                    },
                })
            }
            EventKind::Delete => {
                let projected = self.project(old.as_ref().expect("delete row"));
                Some(match self.dialect {
                    Dialect::Update => RowUpdate {
                        old: Some(projected),
                        ..RowUpdate::default()
                    },
                    _ => RowUpdate {
                        delete: Some(projected),
                        ..RowUpdate::default()
                    },
                })
            }
            EventKind::Modify => {
                let old_row = old.as_ref().expect("modify old row");
                let new_row = new.as_ref().expect("modify new row");
                let diff = self.diff(old_row, new_row);
                if diff.is_empty() {
                    // nothing the subscription watches actually changed
                    None
                } else {
                    Some(match self.dialect {
                        Dialect::Update => RowUpdate {
                            new: Some(self.project(new_row)),
                            ..RowUpdate::default()
                        },
                        _ => RowUpdate {
                            modify: Some(diff),
                            ..RowUpdate::default()
                        },
                    })
                }
            }
        })
    }

    fn row_selected(&self, row: &Row) -> Result<bool, OvsdbError> {
        let table_schema = self.schema.lookup_table(&self.table)?;
        let resolver = NamedUuidResolver::default();
        row_matches_where(table_schema, &resolver, row, self.where_.as_ref())
    }

    /// The columns this subscription reports: the explicit projection, or
    /// every schema column (the implicit `_uuid`/`_version` stay out of
    /// payloads; the row UUID is the notification key).
    fn monitored_columns(&self) -> Vec<String> {
        match &self.columns {
            Some(columns) => columns.clone(),
            None => self
                .schema
                .lookup_table(&self.table)
                .map(|t| t.columns.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    fn project(&self, row: &Row) -> JsonMap {
        self.monitored_columns()
            .iter()
            .filter(|c| c.as_str() != COL_UUID && c.as_str() != COL_VERSION)
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.to_wire())))
            .collect()
    }

    fn diff(&self, old: &Row, new: &Row) -> JsonMap {
        self.monitored_columns()
            .iter()
            .filter(|c| c.as_str() != COL_UUID && c.as_str() != COL_VERSION)
            .filter_map(|c| {
                let new_value = new.get(c)?;
                if old.get(c) == Some(new_value) {
                    None
                } else {
                    Some((c.clone(), new_value.to_wire()))
                }
            })
            .collect()
    }
}

fn decode_optional_row(raw: Option<&str>) -> Result<Option<Row>, OvsdbError> {
    match raw {
        None => Ok(None),
        Some(text) => row_from_json(text)
            .map(Some)
            .map_err(|e| OvsdbError::Internal(format!("undecodable row in watch event: {e}"))),
    }
}

/// One database's watch and its registered updaters, keyed by table prefix.
pub struct DbMonitor {
    db_name: String,
    updaters: Arc<Mutex<HashMap<String, Vec<Updater>>>>,
    task: Option<JoinHandle<()>>,
}

impl DbMonitor {
    pub fn new(db_name: &str) -> DbMonitor {
        DbMonitor {
            db_name: db_name.to_string(),
            updaters: Arc::new(Mutex::new(HashMap::new())),
            task: None,
        }
    }

    pub fn add_updaters(&self, additions: HashMap<String, Vec<Updater>>) {
        let mut updaters = self.updaters.lock();
        for (key, mut ups) in additions {
            updaters.entry(key).or_default().append(&mut ups);
        }
    }

    pub fn remove_updaters(&self, keys: &[String], json_value_key: &str) {
        let mut updaters = self.updaters.lock();
        for key in keys {
            if let Some(ups) = updaters.get_mut(key) {
                ups.retain(|u| u.json_value_key != json_value_key);
                if ups.is_empty() {
                    updaters.remove(key);
                }
            }
        }
    }

    pub fn has_updaters(&self) -> bool {
        !self.updaters.lock().is_empty()
    }

    /// Spawns the dispatch task over the database's watch stream.
    pub fn start(
        &mut self,
        mut events: WatchReceiver,
        notifier: Arc<dyn Notifier>,
        registry: MonitorRegistry,
    ) {
        let updaters = Arc::clone(&self.updaters);
        let db_name = self.db_name.clone();
        self.task = Some(tokio::spawn(async move {
            while let Some(batch) = events.recv().await {
                let mut per_subscription: HashMap<String, TableUpdates> = HashMap::new();
                {
                    let updaters = updaters.lock();
                    for event in &batch {
                        let Some((_, table, uuid)) = Key::parse_data(&event.key) else {
                            continue;
                        };
                        let table_key = Key::table(&db_name, table).to_string();
                        let Some(ups) = updaters.get(&table_key) else {
                            continue;
                        };
                        for updater in ups {
                            match updater.format_event(event) {
                                Ok(Some(row_update)) => {
                                    per_subscription
                                        .entry(updater.json_value_key.clone())
                                        .or_default()
                                        .entry(table.to_string())
                                        .or_default()
                                        .insert(uuid.to_string(), row_update);
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    warn!(db = %db_name, %err, "monitor updater failed")
                                }
                            }
                        }
                    }
                }
                for (json_value_key, updates) in per_subscription {
                    let data = registry.lock().get(&json_value_key).cloned();
                    let Some(data) = data else { continue };
                    let params = notification_params(&data, &updates);
                    debug!(db = %db_name, method = data.dialect.method(), "monitor notification");
                    if let Err(err) = notifier.notify(data.dialect.method(), params).await {
                        warn!(db = %db_name, %err, "monitor notification failed");
                    }
                }
            }
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DbMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn notification_params(data: &MonitorData, updates: &TableUpdates) -> serde_json::Value {
    match data.dialect {
        Dialect::Update | Dialect::Update2 => serde_json::json!([data.json_value, updates]),
        Dialect::Update3 => serde_json::json!([data.json_value, ZERO_UUID, updates]),
    }
}
