//! JSON-RPC payload shapes for the OVSDB methods (RFC 7047 plus the
//! `monitor_cond`/`monitor_cond_since` extensions).

use crate::error::OvsdbError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Transaction marker used by `update3`; this server never batches across
/// transactions, so the marker is always the zero UUID.
pub const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Which notification envelope a monitor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Update,
    Update2,
    Update3,
}

impl Dialect {
    pub fn method(self) -> &'static str {
        match self {
            Dialect::Update => "update",
            Dialect::Update2 => "update2",
            Dialect::Update3 => "update3",
        }
    }
}

/// A UUID in its tagged wire form `["uuid", "…"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireUuid(pub Uuid);

impl Serialize for WireUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ("uuid", self.0.to_string()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WireUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, text): (String, String) = Deserialize::deserialize(deserializer)?;
        if tag != "uuid" {
            return Err(D::Error::custom(format!("expected uuid tag, got {tag}")));
        }
        Uuid::parse_str(&text)
            .map(WireUuid)
            .map_err(|e| D::Error::custom(format!("invalid uuid {text}: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Select,
    Update,
    Mutate,
    Delete,
    Wait,
    Commit,
    Abort,
    Comment,
    Assert,
}

impl OpKind {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OpKind::Insert | OpKind::Update | OpKind::Mutate | OpKind::Delete
        )
    }
}

/// One operation of a `transact` request. Which members apply depends on
/// `op`; the executor validates presence.
#[derive(Debug, Clone, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub row: Option<JsonMap>,
    #[serde(default)]
    pub rows: Option<Vec<JsonMap>>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default, rename = "where")]
    pub where_: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub mutations: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub uuid: Option<WireUuid>,
    #[serde(default, rename = "uuid-name")]
    pub uuid_name: Option<String>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub durable: Option<bool>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactRequest {
    pub db_name: String,
    pub operations: Vec<Operation>,
}

impl TransactRequest {
    /// Parses the `transact` params array: a database name followed by
    /// zero or more operations.
    pub fn from_params(params: &serde_json::Value) -> Result<TransactRequest, OvsdbError> {
        let parts = params
            .as_array()
            .ok_or_else(|| OvsdbError::Ovsdb("transact params must be an array".into()))?;
        let db_name = parts
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| OvsdbError::Ovsdb("transact params lack a database name".into()))?
            .to_string();
        let operations = parts[1..]
            .iter()
            .map(|raw| {
                serde_json::from_value(raw.clone())
                    .map_err(|e| OvsdbError::Ovsdb(format!("malformed operation: {e}")))
            })
            .collect::<Result<Vec<Operation>, _>>()?;
        Ok(TransactRequest {
            db_name,
            operations,
        })
    }
}

/// Per-operation slot of the `transact` response.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OperationResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<WireUuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<JsonMap>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl OperationResult {
    pub fn init_count(&mut self) {
        self.count = Some(0);
    }

    pub fn increment_count(&mut self) {
        self.count = Some(self.count.unwrap_or(0) + 1);
    }

    pub fn init_uuid(&mut self, uuid: Uuid) {
        self.uuid = Some(WireUuid(uuid));
    }

    pub fn init_rows(&mut self) {
        self.rows = Some(Vec::new());
    }

    pub fn append_row(&mut self, row: JsonMap) {
        self.rows.get_or_insert_with(Vec::new).push(row);
    }

    pub fn set_error(&mut self, err: &OvsdbError) {
        self.error = Some(err.code().to_string());
        self.details = err.details().map(str::to_string);
    }
}

/// `select` member of a monitor request; unset flags default to true.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct MonitorSelect {
    #[serde(default)]
    pub initial: Option<bool>,
    #[serde(default)]
    pub insert: Option<bool>,
    #[serde(default)]
    pub delete: Option<bool>,
    #[serde(default)]
    pub modify: Option<bool>,
}

impl MonitorSelect {
    pub fn initial(&self) -> bool {
        self.initial.unwrap_or(true)
    }

    pub fn insert(&self) -> bool {
        self.insert.unwrap_or(true)
    }

    pub fn delete(&self) -> bool {
        self.delete.unwrap_or(true)
    }

    pub fn modify(&self) -> bool {
        self.modify.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MonitorCondRequest {
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default, rename = "where")]
    pub where_: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub select: Option<MonitorSelect>,
}

#[derive(Debug, Clone)]
pub struct CondMonitorParameters {
    pub db_name: String,
    pub json_value: serde_json::Value,
    pub requests: BTreeMap<String, Vec<MonitorCondRequest>>,
    pub last_txn_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrManyRequests {
    Many(Vec<MonitorCondRequest>),
    One(MonitorCondRequest),
}

impl CondMonitorParameters {
    /// Parses `monitor`/`monitor_cond`/`monitor_cond_since` params:
    /// `[db, json-value, requests]` with an optional trailing
    /// `last-txn-id`. The per-table request may be a single object or an
    /// array of objects; omitting the requests member monitors nothing.
    pub fn from_params(params: &serde_json::Value) -> Result<CondMonitorParameters, OvsdbError> {
        let parts = params
            .as_array()
            .ok_or_else(|| OvsdbError::Ovsdb("monitor params must be an array".into()))?;
        if parts.len() < 2 || parts.len() > 4 {
            return Err(OvsdbError::Ovsdb(format!(
                "wrong length of condition monitor parameters: {}",
                parts.len()
            )));
        }
        let db_name = parts[0]
            .as_str()
            .ok_or_else(|| {
                OvsdbError::Ovsdb(format!("monitored database name is not a string: {}", parts[0]))
            })?
            .to_string();
        let raw_requests: BTreeMap<String, OneOrManyRequests> = match parts.get(2) {
            None => BTreeMap::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                OvsdbError::Ovsdb(format!("malformed monitor condition requests: {e}"))
            })?,
        };
        let requests = raw_requests
            .into_iter()
            .map(|(table, reqs)| {
                let reqs = match reqs {
                    OneOrManyRequests::Many(v) => v,
                    OneOrManyRequests::One(r) => vec![r],
                };
                (table, reqs)
            })
            .collect();
        let last_txn_id = match parts.get(3) {
            None => None,
            Some(raw) => Some(
                raw.as_str()
                    .ok_or_else(|| {
                        OvsdbError::Ovsdb(format!("last transaction id is not a string: {raw}"))
                    })?
                    .to_string(),
            ),
        };
        Ok(CondMonitorParameters {
            db_name,
            json_value: parts[1].clone(),
            requests,
            last_txn_id,
        })
    }
}

/// One row's worth of a notification. Exactly one member is set for
/// `update2`/`update3`; `update` uses `new`/`old`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modify: Option<JsonMap>,
}

/// `uuid → row update` for one table.
pub type TableUpdate = BTreeMap<String, RowUpdate>;
/// `table → table update` for one notification.
pub type TableUpdates = BTreeMap<String, TableUpdate>;

/// Canonical string form of a monitor's opaque `json-value`, used to key
/// handler-side maps.
pub fn json_value_key(json_value: &serde_json::Value) -> String {
    json_value.to_string()
}
