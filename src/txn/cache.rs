use crate::catalog::schema::{ColumnKind, DatabaseSchema, RefKind};
use crate::catalog::types::{Atom, Row, Value, row_from_json};
use crate::error::OvsdbError;
use crate::storage::keyspace::Key;
use crate::storage::kv::KvPair;
use std::collections::BTreeMap;

pub type TableRows = BTreeMap<String, Row>;

/// Transaction-local snapshot: `database → table → uuid → row`.
///
/// Populated from the pre-phase KV reads, mutated as operations apply, and
/// re-validated after every operation. Deliberately single-threaded.
#[derive(Debug, Default)]
pub struct TxnCache {
    databases: BTreeMap<String, BTreeMap<String, TableRows>>,
}

impl TxnCache {
    /// Ingests the ranges of a multi-get KV response, keyed by decoded
    /// data keys. Keys outside the data keyspace are ignored.
    pub fn ingest(&mut self, ranges: &[Vec<KvPair>]) -> Result<(), OvsdbError> {
        for range in ranges {
            for pair in range {
                let Some((db, table, uuid)) = Key::parse_data(&pair.key) else {
                    continue;
                };
                let row = row_from_json(&pair.value).map_err(|e| {
                    OvsdbError::Internal(format!("undecodable row at {}: {e}", pair.key))
                })?;
                self.databases
                    .entry(db.to_string())
                    .or_default()
                    .entry(table.to_string())
                    .or_default()
                    .insert(uuid.to_string(), row);
            }
        }
        Ok(())
    }

    /// Runs the schema unmarshal pass over every cached row of `db`.
    pub fn unmarshal(&mut self, db: &str, schema: &DatabaseSchema) -> Result<(), OvsdbError> {
        let Some(tables) = self.databases.get_mut(db) else {
            return Ok(());
        };
        for (table_name, rows) in tables.iter_mut() {
            let table_schema = schema.lookup_table(table_name)?;
            for row in rows.values_mut() {
                table_schema.unmarshal_row(row)?;
            }
        }
        Ok(())
    }

    /// Schema-validates every cached row of `db`, then checks strong
    /// references against the tables this transaction has loaded. Targets
    /// in untouched tables are not fetched just to verify.
    pub fn validate(&self, db: &str, schema: &DatabaseSchema) -> Result<(), OvsdbError> {
        let Some(tables) = self.databases.get(db) else {
            return Ok(());
        };
        for (table_name, rows) in tables {
            let table_schema = schema.lookup_table(table_name)?;
            for (uuid, row) in rows {
                table_schema.validate_row(row).map_err(|e| {
                    OvsdbError::ConstraintViolation(format!(
                        "row {uuid} of table {table_name}: {e}"
                    ))
                })?;
                for (column_name, value) in row {
                    let column = table_schema.lookup_column(column_name)?;
                    if column.key.ref_kind != RefKind::Strong {
                        continue;
                    }
                    let Some(ref_table) = column.key.ref_table.as_deref() else {
                        continue;
                    };
                    let Some(targets) = tables.get(ref_table) else {
                        continue;
                    };
                    for target in referenced_uuids(column.kind, value) {
                        if !targets.contains_key(&target) {
                            return Err(OvsdbError::ReferentialIntegrity(format!(
                                "row {uuid} of table {table_name} references missing \
                                 {ref_table} row {target} via {column_name}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The mutable slot for `(db, table, uuid)`, created on first touch.
    pub fn row_mut(&mut self, db: &str, table: &str, uuid: &str) -> &mut Row {
        self.databases
            .entry(db.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .entry(uuid.to_string())
            .or_default()
    }

    pub fn table(&self, db: &str, table: &str) -> Option<&TableRows> {
        self.databases.get(db).and_then(|tables| tables.get(table))
    }

    pub fn contains_row(&self, db: &str, table: &str, uuid: &str) -> bool {
        self.table(db, table)
            .is_some_and(|rows| rows.contains_key(uuid))
    }

    /// Snapshot of a table for iteration while later writes land in the
    /// cache; rows inserted mid-operation stay invisible to that operation.
    pub fn table_snapshot(&self, db: &str, table: &str) -> Vec<(String, Row)> {
        self.table(db, table)
            .map(|rows| {
                rows.iter()
                    .map(|(uuid, row)| (uuid.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn referenced_uuids(kind: ColumnKind, value: &Value) -> Vec<String> {
    let atom_uuid = |atom: &Atom| match atom {
        Atom::Uuid(u) => Some(u.to_string()),
        _ => None,
    };
    match (kind, value) {
        (ColumnKind::Atomic, Value::Atom(a)) => atom_uuid(a).into_iter().collect(),
        (ColumnKind::Set, Value::Set(atoms)) => atoms.iter().filter_map(atom_uuid).collect(),
        (ColumnKind::Map, Value::Map(entries)) => entries
            .iter()
            .filter_map(|(_, v)| atom_uuid(v))
            .collect(),
        _ => Vec::new(),
    }
}
