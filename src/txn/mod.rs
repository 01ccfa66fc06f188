//! Two-phase transaction execution.
//!
//! Phase one walks the operation list collecting KV reads (whole-table
//! prefixes, narrowed to a single row when a `where` pins `_uuid`), commits
//! them as one read-only KV transaction, and loads the cache. Phase two
//! re-walks the list applying each operation against the cache while
//! appending `Put`/`Delete` ops, then commits the deduplicated write set
//! atomically. Any failure short-circuits: the failing result slot carries
//! the error and nothing is written.

pub mod cache;
pub mod condition;
pub mod mutation;
pub mod resolver;

use crate::catalog::schema::{ColumnKind, DatabaseSchema, TableSchema};
use crate::catalog::types::{
    COL_UUID, COL_VERSION, Row, Value, reduce_row_by_columns, row_to_json, set_row_uuid,
    set_row_version,
};
use crate::error::OvsdbError;
use crate::protocol::{JsonMap, OpKind, Operation, OperationResult, TransactRequest};
use crate::storage::keyspace::Key;
use crate::storage::kv::{KvOp, KvStore, KvTxn, KvTxnResponse};
use crate::txn::cache::TxnCache;
use crate::txn::condition::{row_matches_where, where_pinned_uuid};
use crate::txn::mutation::Mutation;
use crate::txn::resolver::NamedUuidResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Transaction {
    db: String,
    schema: Arc<DatabaseSchema>,
    request: TransactRequest,
    /// Parallel to the request's operation list.
    pub results: Vec<OperationResult>,
    /// Error code of the first failing operation.
    pub error: Option<String>,
    cache: TxnCache,
    resolver: NamedUuidResolver,
    kv: Arc<dyn KvStore>,
    kv_timeout: Duration,
    pending: KvTxn,
}

impl Transaction {
    pub fn new(
        kv: Arc<dyn KvStore>,
        kv_timeout: Duration,
        schema: Arc<DatabaseSchema>,
        request: TransactRequest,
    ) -> Transaction {
        debug!(
            db = %request.db_name,
            operations = request.operations.len(),
            "new transaction"
        );
        let results = vec![OperationResult::default(); request.operations.len()];
        Transaction {
            db: request.db_name.clone(),
            schema,
            request,
            results,
            error: None,
            cache: TxnCache::default(),
            resolver: NamedUuidResolver::default(),
            kv,
            kv_timeout,
            pending: KvTxn::default(),
        }
    }

    /// Executes the whole request; returns the KV revision of the commit.
    pub async fn commit(&mut self) -> Result<i64, OvsdbError> {
        if let Err(err) = self.check_select_write_mix() {
            self.error = Some(err.code().to_string());
            return Err(err);
        }

        self.pending.clear();
        for index in 0..self.request.operations.len() {
            let op = self.request.operations[index].clone();
            if let Err(err) = self.pre(&op) {
                self.fail(index, err.clone());
                return Err(err);
            }
        }
        if let Err(err) = self.flush_reads().await {
            self.error = Some(err.code().to_string());
            return Err(err);
        }

        self.pending.clear();
        for index in 0..self.request.operations.len() {
            let op = self.request.operations[index].clone();
            if let Err(err) = self.apply(&op, index) {
                self.fail(index, err.clone());
                return Err(err);
            }
            // A cache that stops validating after an applied operation is a
            // programmer error, not a client error.
            if let Err(err) = self.cache.validate(&self.db, &self.schema) {
                panic!("cache validation failed after {:?} operation: {err}", op.op);
            }
        }

        self.dedup_writes();
        let response = match self.flush_writes().await {
            Ok(response) => response,
            Err(err) => {
                self.error = Some(err.code().to_string());
                return Err(err);
            }
        };
        debug!(db = %self.db, revision = response.revision, "transaction committed");
        Ok(response.revision)
    }

    fn fail(&mut self, index: usize, err: OvsdbError) {
        self.results[index].set_error(&err);
        self.error = Some(err.code().to_string());
    }

    /// `select` may not share a transaction with write operations.
    fn check_select_write_mix(&self) -> Result<(), OvsdbError> {
        let mut has_select = false;
        let mut has_write = false;
        for op in &self.request.operations {
            match op.op {
                OpKind::Select => has_select = true,
                kind if kind.is_write() => has_write = true,
                _ => {}
            }
        }
        if has_select && has_write {
            return Err(OvsdbError::ConstraintViolation(
                "can't mix select with write operations".into(),
            ));
        }
        Ok(())
    }

    /* pre phase: queue the reads each operation will need */

    fn pre(&mut self, op: &Operation) -> Result<(), OvsdbError> {
        match op.op {
            OpKind::Insert => self.pre_insert(op),
            OpKind::Select | OpKind::Update | OpKind::Mutate | OpKind::Delete => {
                self.queue_read_by_where(op)
            }
            OpKind::Wait => self.pre_wait(op),
            OpKind::Commit => pre_commit(op),
            OpKind::Abort => Err(OvsdbError::Aborted),
            OpKind::Comment | OpKind::Assert => Ok(()),
        }
    }

    fn pre_insert(&mut self, op: &Operation) -> Result<(), OvsdbError> {
        if let Some(name) = &op.uuid_name {
            if self.resolver.contains(name) {
                return Err(OvsdbError::DuplicateUuidName(name.clone()));
            }
            let uuid = op.uuid.map(|w| w.0).unwrap_or_else(Uuid::new_v4);
            self.resolver.set(name, uuid);
        }
        let table = required_table(op)?;
        let prefix = Key::table(&self.db, table).to_string();
        self.pending.then.push(KvOp::Get { prefix });
        Ok(())
    }

    fn queue_read_by_where(&mut self, op: &Operation) -> Result<(), OvsdbError> {
        let table = required_table(op)?;
        let table_schema = self
            .schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;
        let pinned = where_pinned_uuid(table_schema, &self.resolver, op.where_.as_ref())?;
        let prefix = match pinned {
            Some(uuid) => Key::data(&self.db, table, uuid.to_string()).to_string(),
            None => Key::table(&self.db, table).to_string(),
        };
        self.pending.then.push(KvOp::Get { prefix });
        Ok(())
    }

    fn pre_wait(&mut self, op: &Operation) -> Result<(), OvsdbError> {
        let Some(timeout) = op.timeout else {
            return Err(OvsdbError::ConstraintViolation(
                "wait without timeout parameter".into(),
            ));
        };
        if timeout != 0 {
            warn!(timeout, "ignoring non-zero wait timeout");
        }
        self.queue_read_by_where(op)
    }

    /* apply phase */

    fn apply(&mut self, op: &Operation, index: usize) -> Result<(), OvsdbError> {
        match op.op {
            OpKind::Insert => self.do_insert(op, index),
            OpKind::Select => self.do_select(op, index),
            OpKind::Update => self.do_update(op, index),
            OpKind::Mutate => self.do_mutate(op, index),
            OpKind::Delete => self.do_delete(op, index),
            OpKind::Wait => self.do_wait(op),
            OpKind::Comment => self.do_comment(op),
            OpKind::Commit | OpKind::Abort | OpKind::Assert => Ok(()),
        }
    }

    fn do_insert(&mut self, op: &Operation, index: usize) -> Result<(), OvsdbError> {
        let schema = Arc::clone(&self.schema);
        let table = required_table(op)?;
        let table_schema = schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;

        let mut uuid = op.uuid.map(|w| w.0);
        if let Some(name) = &op.uuid_name {
            let bound = self.resolver.get(name)?;
            if uuid.is_some_and(|u| u != bound) {
                return Err(OvsdbError::Internal(format!(
                    "mismatching uuid-name {name} and uuid"
                )));
            }
            uuid = Some(bound);
        }
        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        let uuid_text = uuid.to_string();
        if self.cache.contains_row(&self.db, table, &uuid_text) {
            return Err(OvsdbError::DuplicateUuid(uuid_text));
        }
        self.results[index].init_uuid(uuid);

        let mut row = row_from_wire(op.row.as_ref().cloned().unwrap_or_default())?;
        table_schema.default_row(&mut row);
        self.row_prepare(table_schema, &mut row)?;
        set_row_uuid(&mut row, uuid);
        set_row_version(&mut row);

        let key = Key::data(&self.db, table, &uuid_text).to_string();
        let value = row_to_json(&row).map_err(OvsdbError::Internal)?;
        self.pending.then.push(KvOp::Put { key, value });
        *self.cache.row_mut(&self.db, table, &uuid_text) = row;
        Ok(())
    }

    fn do_select(&mut self, op: &Operation, index: usize) -> Result<(), OvsdbError> {
        self.results[index].init_rows();
        let schema = Arc::clone(&self.schema);
        let table = required_table(op)?;
        let table_schema = schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;
        for (_, row) in self.cache.table_snapshot(&self.db, table) {
            if !row_matches_where(table_schema, &self.resolver, &row, op.where_.as_ref())? {
                continue;
            }
            let projected = reduce_row_by_columns(&row, op.columns.as_ref());
            self.results[index].append_row(row_to_wire_map(&projected));
        }
        Ok(())
    }

    fn do_update(&mut self, op: &Operation, index: usize) -> Result<(), OvsdbError> {
        self.results[index].init_count();
        let schema = Arc::clone(&self.schema);
        let table = required_table(op)?;
        let table_schema = schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;
        let payload_raw = op.row.as_ref().cloned().unwrap_or_default();
        for (uuid, row) in self.cache.table_snapshot(&self.db, table) {
            if !row_matches_where(table_schema, &self.resolver, &row, op.where_.as_ref())? {
                continue;
            }
            let mut payload = row_from_wire(payload_raw.clone())?;
            self.row_prepare(table_schema, &mut payload)?;
            let new_row = updated_row(table_schema, &row, payload)?;
            let key = Key::data(&self.db, table, &uuid).to_string();
            let value = row_to_json(&new_row).map_err(OvsdbError::Internal)?;
            self.pending.then.push(KvOp::Put { key, value });
            *self.cache.row_mut(&self.db, table, &uuid) = new_row;
            self.results[index].increment_count();
        }
        Ok(())
    }

    fn do_mutate(&mut self, op: &Operation, index: usize) -> Result<(), OvsdbError> {
        self.results[index].init_count();
        let schema = Arc::clone(&self.schema);
        let table = required_table(op)?;
        let table_schema = schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;
        let mutations = op.mutations.as_ref().cloned().unwrap_or_default();
        for (uuid, row) in self.cache.table_snapshot(&self.db, table) {
            if !row_matches_where(table_schema, &self.resolver, &row, op.where_.as_ref())? {
                continue;
            }
            let mut new_row = row.clone();
            for raw in &mutations {
                Mutation::new(table_schema, &self.resolver, raw)?.apply(&mut new_row)?;
            }
            set_row_version(&mut new_row);
            let key = Key::data(&self.db, table, &uuid).to_string();
            let value = row_to_json(&new_row).map_err(OvsdbError::Internal)?;
            self.pending.then.push(KvOp::Put { key, value });
            *self.cache.row_mut(&self.db, table, &uuid) = new_row;
            self.results[index].increment_count();
        }
        Ok(())
    }

    fn do_delete(&mut self, op: &Operation, index: usize) -> Result<(), OvsdbError> {
        self.results[index].init_count();
        let schema = Arc::clone(&self.schema);
        let table = required_table(op)?;
        let table_schema = schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;
        for (uuid, row) in self.cache.table_snapshot(&self.db, table) {
            if !row_matches_where(table_schema, &self.resolver, &row, op.where_.as_ref())? {
                continue;
            }
            let key = Key::data(&self.db, table, &uuid).to_string();
            self.pending.then.push(KvOp::Delete { key });
            self.results[index].increment_count();
        }
        Ok(())
    }

    fn do_wait(&mut self, op: &Operation) -> Result<(), OvsdbError> {
        let table = required_table(op)?;
        let Some(rows) = &op.rows else {
            return Err(OvsdbError::ConstraintViolation(
                "wait without rows parameter".into(),
            ));
        };
        if rows.is_empty() {
            return Ok(());
        }
        let until_equal = match op.until.as_deref() {
            Some("==") => true,
            Some("!=") => false,
            Some(other) => {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "unsupported wait until {other}"
                )));
            }
            None => {
                return Err(OvsdbError::ConstraintViolation(
                    "wait without until parameter".into(),
                ));
            }
        };
        let schema = Arc::clone(&self.schema);
        let table_schema = schema
            .lookup_table(table)
            .map_err(|_| OvsdbError::Internal(format!("no schema for table {table}")))?;

        for (_, actual) in self.cache.table_snapshot(&self.db, table) {
            if !row_matches_where(table_schema, &self.resolver, &actual, op.where_.as_ref())? {
                continue;
            }
            let actual = reduce_row_by_columns(&actual, op.columns.as_ref());
            for raw in rows {
                let mut expected = row_from_wire(raw.clone())?;
                self.row_prepare(table_schema, &mut expected)?;
                if rows_equal(table_schema, &expected, &actual)? {
                    if until_equal {
                        return Ok(());
                    }
                    return Err(OvsdbError::TimedOut);
                }
            }
        }
        // The observed implementation never blocks: one pass, then verdict.
        if until_equal {
            return Err(OvsdbError::TimedOut);
        }
        Ok(())
    }

    fn do_comment(&mut self, op: &Operation) -> Result<(), OvsdbError> {
        let Some(comment) = &op.comment else {
            return Err(OvsdbError::ConstraintViolation(
                "comment without comment parameter".into(),
            ));
        };
        let timestamp = chrono::Utc::now().to_rfc3339();
        let key = Key::comment(&self.db, timestamp).to_string();
        self.pending.then.push(KvOp::Put {
            key,
            value: comment.clone(),
        });
        Ok(())
    }

    /// Unmarshal, resolve named UUIDs, and schema-validate, in that order.
    fn row_prepare(&self, table_schema: &TableSchema, row: &mut Row) -> Result<(), OvsdbError> {
        table_schema.unmarshal_row(row)?;
        self.resolver.resolve_row(row)?;
        table_schema.validate_row(row)
    }

    /* KV plumbing */

    async fn flush_reads(&mut self) -> Result<(), OvsdbError> {
        let response = self.kv_commit().await?;
        self.cache.ingest(&response.ranges)?;
        self.cache.unmarshal(&self.db, &self.schema)?;
        self.cache.validate(&self.db, &self.schema)
    }

    async fn flush_writes(&mut self) -> Result<KvTxnResponse, OvsdbError> {
        self.kv_commit().await
    }

    async fn kv_commit(&mut self) -> Result<KvTxnResponse, OvsdbError> {
        let txn = std::mem::take(&mut self.pending);
        debug!(ops = txn.then.len(), "kv transaction");
        let result = tokio::time::timeout(self.kv_timeout, self.kv.commit(txn))
            .await
            .map_err(|_| OvsdbError::Io("kv call deadline exceeded".into()))?;
        result.map_err(|err| match err {
            OvsdbError::Io(_) => err,
            other => OvsdbError::Io(other.to_string()),
        })
    }

    /// The KV store refuses two writes to one key in a single transaction;
    /// keep only the last op per key, preserving the survivors' order.
    fn dedup_writes(&mut self) {
        let mut last_index: HashMap<String, usize> = HashMap::new();
        for (index, op) in self.pending.then.iter().enumerate() {
            last_index.insert(op.key().to_string(), index);
        }
        let mut index = 0;
        self.pending.then.retain(|op| {
            let keep = last_index[op.key()] == index;
            index += 1;
            keep
        });
    }
}

fn pre_commit(op: &Operation) -> Result<(), OvsdbError> {
    let Some(durable) = op.durable else {
        return Err(OvsdbError::ConstraintViolation(
            "commit without durable parameter".into(),
        ));
    };
    if durable {
        return Err(OvsdbError::NotSupported(
            "durable commit is not supported".into(),
        ));
    }
    Ok(())
}

fn required_table<'a>(op: &'a Operation) -> Result<&'a str, OvsdbError> {
    op.table.as_deref().ok_or_else(|| {
        OvsdbError::ConstraintViolation(format!("{:?} operation without table", op.op))
    })
}

fn row_from_wire(raw: JsonMap) -> Result<Row, OvsdbError> {
    let mut row = Row::new();
    for (column, value) in raw {
        let value = Value::from_wire(&value).map_err(|e| {
            OvsdbError::ConstraintViolation(format!("column {column}: {e}"))
        })?;
        row.insert(column, value);
    }
    Ok(row)
}

fn row_to_wire_map(row: &Row) -> JsonMap {
    row.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect()
}

/// Builds the post-update row: map columns merge key-by-key, everything
/// else is replaced; `_uuid`/`_version` and immutable columns reject.
fn updated_row(
    table_schema: &TableSchema,
    current: &Row,
    payload: Row,
) -> Result<Row, OvsdbError> {
    let mut new_row = current.clone();
    for (column, value) in payload {
        if column == COL_UUID || column == COL_VERSION {
            return Err(OvsdbError::ConstraintViolation(format!(
                "update of implicit column {column}"
            )));
        }
        let column_schema = table_schema.lookup_column(&column)?;
        if !column_schema.mutable {
            return Err(OvsdbError::ConstraintViolation(format!(
                "update of immutable column {column}"
            )));
        }
        let merged = match (column_schema.kind, new_row.get(&column), &value) {
            (ColumnKind::Map, Some(Value::Map(old)), Value::Map(new)) => {
                let mut entries = old.clone();
                for (k, v) in new {
                    match entries.iter_mut().find(|(ek, _)| ek == k) {
                        Some((_, ev)) => *ev = v.clone(),
                        None => entries.push((k.clone(), v.clone())),
                    }
                }
                entries.sort();
                Value::Map(entries)
            }
            _ => value,
        };
        new_row.insert(column, merged);
    }
    set_row_version(&mut new_row);
    Ok(new_row)
}

/// Compares the expected row against the actual, column by column, with
/// set/map comparisons order-insensitive.
fn rows_equal(
    table_schema: &TableSchema,
    expected: &Row,
    actual: &Row,
) -> Result<bool, OvsdbError> {
    for (column, expected_value) in expected {
        table_schema.lookup_column(column)?;
        match actual.get(column) {
            Some(actual_value) if actual_value == expected_value => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}
