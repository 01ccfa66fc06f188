use crate::catalog::types::{Atom, COL_UUID, COL_VERSION, Row, Value};
use crate::error::OvsdbError;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseKind {
    Integer,
    Real,
    Boolean,
    String,
    Uuid,
}

impl BaseKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, BaseKind::Integer | BaseKind::Real)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    #[default]
    Strong,
    Weak,
}

/// One side of a column type: the base kind plus its constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseType {
    pub kind: BaseKind,
    pub ref_table: Option<String>,
    pub ref_kind: RefKind,
    pub min_integer: Option<i64>,
    pub max_integer: Option<i64>,
    pub min_real: Option<f64>,
    pub max_real: Option<f64>,
}

impl BaseType {
    pub const fn plain(kind: BaseKind) -> BaseType {
        BaseType {
            kind,
            ref_table: None,
            ref_kind: RefKind::Strong,
            min_integer: None,
            max_integer: None,
            min_real: None,
            max_real: None,
        }
    }

    fn check_atom(&self, atom: &Atom) -> Result<(), String> {
        match (self.kind, atom) {
            (BaseKind::Integer, Atom::Integer(i)) => {
                if self.min_integer.is_some_and(|min| *i < min)
                    || self.max_integer.is_some_and(|max| *i > max)
                {
                    return Err(format!("integer {i} outside schema bounds"));
                }
                Ok(())
            }
            (BaseKind::Real, Atom::Real(_)) => Ok(()),
            (BaseKind::Boolean, Atom::Boolean(_)) => Ok(()),
            (BaseKind::String, Atom::String(_)) => Ok(()),
            (BaseKind::Uuid, Atom::Uuid(_)) => Ok(()),
            (BaseKind::Uuid, Atom::Named(n)) => Err(format!("unresolved named-uuid {n}")),
            (expected, got) => Err(format!(
                "expected {expected:?} atom, got {}",
                got.type_name()
            )),
        }
    }

    /// Aligns JSON's single number type with the schema's integer/real split.
    fn coerce_atom(&self, atom: Atom) -> Atom {
        match (self.kind, atom) {
            (BaseKind::Integer, Atom::Real(f)) if f.fract() == 0.0 => Atom::Integer(f as i64),
            (BaseKind::Real, Atom::Integer(i)) => Atom::Real(i as f64),
            (_, atom) => atom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Atomic,
    Set,
    Map,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub kind: ColumnKind,
    pub key: BaseType,
    pub value: Option<BaseType>,
    pub min: u64,
    /// `None` means unlimited.
    pub max: Option<u64>,
    pub mutable: bool,
    pub ephemeral: bool,
}

/// Schema for the implicit `_uuid` and `_version` columns.
static IMPLICIT_UUID_COLUMN: ColumnSchema = ColumnSchema {
    kind: ColumnKind::Atomic,
    key: BaseType::plain(BaseKind::Uuid),
    value: None,
    min: 1,
    max: Some(1),
    mutable: false,
    ephemeral: false,
};

impl ColumnSchema {
    pub fn default_value(&self) -> Value {
        match self.kind {
            ColumnKind::Set => Value::Set(Vec::new()),
            ColumnKind::Map => Value::Map(Vec::new()),
            ColumnKind::Atomic => Value::Atom(match self.key.kind {
                BaseKind::Integer => Atom::Integer(0),
                BaseKind::Real => Atom::Real(0.0),
                BaseKind::Boolean => Atom::Boolean(false),
                BaseKind::String => Atom::String(String::new()),
                BaseKind::Uuid => Atom::Uuid(Uuid::nil()),
            }),
        }
    }

    /// Normalizes a decoded wire value into canonical typed form: bare atoms
    /// become singleton sets for set columns, singleton sets collapse for
    /// atomic columns, numbers align with the base kind, containers sort.
    pub fn normalize(&self, value: Value) -> Result<Value, String> {
        match self.kind {
            ColumnKind::Atomic => {
                let atom = match value {
                    Value::Atom(a) => a,
                    Value::Set(mut atoms) if atoms.len() == 1 => atoms.remove(0),
                    other => {
                        return Err(format!(
                            "expected an atomic value, got {}",
                            other.type_name()
                        ));
                    }
                };
                Ok(Value::Atom(self.key.coerce_atom(atom)))
            }
            ColumnKind::Set => {
                let atoms = match value {
                    Value::Atom(a) => vec![a],
                    Value::Set(atoms) => atoms,
                    Value::Map(_) => return Err("expected a set, got a map".to_string()),
                };
                let mut atoms: Vec<Atom> = atoms
                    .into_iter()
                    .map(|a| self.key.coerce_atom(a))
                    .collect();
                atoms.sort();
                Ok(Value::Set(atoms))
            }
            ColumnKind::Map => {
                let Value::Map(entries) = value else {
                    return Err(format!("expected a map, got {}", value.type_name()));
                };
                let value_type = self.value.as_ref().expect("map column carries a value type");
                let mut entries: Vec<(Atom, Atom)> = entries
                    .into_iter()
                    .map(|(k, v)| (self.key.coerce_atom(k), value_type.coerce_atom(v)))
                    .collect();
                entries.sort();
                Ok(Value::Map(entries))
            }
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), String> {
        match (self.kind, value) {
            (ColumnKind::Atomic, Value::Atom(atom)) => self.key.check_atom(atom),
            (ColumnKind::Set, Value::Set(atoms)) => {
                let len = atoms.len() as u64;
                if len < self.min {
                    return Err(format!("set has {len} elements, schema minimum {}", self.min));
                }
                if self.max.is_some_and(|max| len > max) {
                    return Err(format!(
                        "set has {len} elements, schema maximum {}",
                        self.max.unwrap_or_default()
                    ));
                }
                atoms.iter().try_for_each(|a| self.key.check_atom(a))
            }
            (ColumnKind::Map, Value::Map(entries)) => {
                let value_type = self.value.as_ref().expect("map column carries a value type");
                for window in entries.windows(2) {
                    if window[0].0 == window[1].0 {
                        return Err(format!("duplicate map key {:?}", window[0].0));
                    }
                }
                for (k, v) in entries {
                    self.key.check_atom(k)?;
                    value_type.check_atom(v)?;
                }
                Ok(())
            }
            (_, got) => Err(format!(
                "column kind {:?} does not admit a {}",
                self.kind,
                got.type_name()
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    pub columns: BTreeMap<String, ColumnSchema>,
}

impl TableSchema {
    pub fn lookup_column(&self, name: &str) -> Result<&ColumnSchema, OvsdbError> {
        if name == COL_UUID || name == COL_VERSION {
            return Ok(&IMPLICIT_UUID_COLUMN);
        }
        self.columns.get(name).ok_or_else(|| {
            OvsdbError::ConstraintViolation(format!("no column {name} in table schema"))
        })
    }

    /// Fills every missing column with its schema default.
    pub fn default_row(&self, row: &mut Row) {
        for (name, column) in &self.columns {
            if !row.contains_key(name) {
                row.insert(name.clone(), column.default_value());
            }
        }
    }

    /// Converts loosely typed values into canonical typed form, column-wise.
    /// Columns absent from the row are left absent.
    pub fn unmarshal_row(&self, row: &mut Row) -> Result<(), OvsdbError> {
        let names: Vec<String> = row.keys().cloned().collect();
        for name in names {
            let column = self.lookup_column(&name)?;
            let value = row.remove(&name).expect("column just enumerated");
            let normalized = column.normalize(value).map_err(|e| {
                OvsdbError::ConstraintViolation(format!("column {name}: {e}"))
            })?;
            row.insert(name, normalized);
        }
        Ok(())
    }

    /// Validates every column present in the row. Partial rows are fine;
    /// `default_row` is what guarantees completeness on insert.
    pub fn validate_row(&self, row: &Row) -> Result<(), OvsdbError> {
        for (name, value) in row {
            let column = self.lookup_column(name)?;
            column.validate(value).map_err(|e| {
                OvsdbError::ConstraintViolation(format!("column {name}: {e}"))
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseSchema {
    pub name: String,
    pub version: Option<String>,
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    pub fn parse(text: &str) -> Result<DatabaseSchema, OvsdbError> {
        let raw: RawSchema = serde_json::from_str(text)
            .map_err(|e| OvsdbError::Ovsdb(format!("invalid schema: {e}")))?;
        let mut tables = BTreeMap::new();
        for (table_name, raw_table) in raw.tables {
            let mut columns = BTreeMap::new();
            for (column_name, raw_column) in raw_table.columns {
                if column_name == COL_UUID || column_name == COL_VERSION {
                    return Err(OvsdbError::Ovsdb(format!(
                        "invalid schema: table {table_name} declares implicit column {column_name}"
                    )));
                }
                columns.insert(column_name, raw_column.into_column());
            }
            tables.insert(table_name, TableSchema { columns });
        }
        Ok(DatabaseSchema {
            name: raw.name,
            version: raw.version,
            tables,
        })
    }

    pub fn lookup_table(&self, name: &str) -> Result<&TableSchema, OvsdbError> {
        self.tables.get(name).ok_or_else(|| {
            OvsdbError::ConstraintViolation(format!("no table {name} in schema {}", self.name))
        })
    }
}

/* raw serde shapes for the irregular schema JSON */

#[derive(Deserialize)]
struct RawSchema {
    name: String,
    #[serde(default)]
    version: Option<String>,
    tables: BTreeMap<String, RawTable>,
}

#[derive(Deserialize)]
struct RawTable {
    columns: BTreeMap<String, RawColumn>,
}

#[derive(Deserialize)]
struct RawColumn {
    #[serde(rename = "type")]
    type_decl: RawType,
    #[serde(default)]
    mutable: Option<bool>,
    #[serde(default)]
    ephemeral: Option<bool>,
}

impl RawColumn {
    fn into_column(self) -> ColumnSchema {
        let (key, value, min, max) = match self.type_decl {
            RawType::Base(kind) => (BaseType::plain(kind), None, 1, Some(1)),
            RawType::Composite(c) => {
                let key = c.key.into_base_type();
                let value = c.value.map(RawBase::into_base_type);
                let min = c.min.unwrap_or(1);
                let max = match c.max {
                    None => Some(1),
                    Some(RawMax::Bounded(n)) => Some(n),
                    Some(RawMax::Unlimited(_)) => None,
                };
                (key, value, min, max)
            }
        };
        let kind = if value.is_some() {
            ColumnKind::Map
        } else if min == 1 && max == Some(1) {
            ColumnKind::Atomic
        } else {
            ColumnKind::Set
        };
        ColumnSchema {
            kind,
            key,
            value,
            min,
            max,
            mutable: self.mutable.unwrap_or(true),
            ephemeral: self.ephemeral.unwrap_or(false),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawType {
    Base(BaseKind),
    Composite(RawComposite),
}

#[derive(Deserialize)]
struct RawComposite {
    key: RawBase,
    #[serde(default)]
    value: Option<RawBase>,
    #[serde(default)]
    min: Option<u64>,
    #[serde(default)]
    max: Option<RawMax>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMax {
    Bounded(u64),
    Unlimited(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBase {
    Kind(BaseKind),
    Full(RawBaseFull),
}

impl RawBase {
    fn into_base_type(self) -> BaseType {
        match self {
            RawBase::Kind(kind) => BaseType::plain(kind),
            RawBase::Full(full) => BaseType {
                kind: full.kind,
                ref_table: full.ref_table,
                ref_kind: full.ref_type.unwrap_or_default(),
                min_integer: full.min_integer,
                max_integer: full.max_integer,
                min_real: full.min_real,
                max_real: full.max_real,
            },
        }
    }
}

#[derive(Deserialize)]
struct RawBaseFull {
    #[serde(rename = "type")]
    kind: BaseKind,
    #[serde(default, rename = "refTable")]
    ref_table: Option<String>,
    #[serde(default, rename = "refType")]
    ref_type: Option<RefKind>,
    #[serde(default, rename = "minInteger")]
    min_integer: Option<i64>,
    #[serde(default, rename = "maxInteger")]
    max_integer: Option<i64>,
    #[serde(default, rename = "minReal")]
    min_real: Option<f64>,
    #[serde(default, rename = "maxReal")]
    max_real: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::{BaseKind, ColumnKind, DatabaseSchema};
    use crate::catalog::types::{Atom, Value};

    const SCHEMA: &str = r#"{
        "name": "OVN_Northbound",
        "version": "5.30.0",
        "tables": {
            "ACL": {
                "columns": {
                    "action": {"type": {"key": {"type": "string",
                        "enum": ["set", ["allow", "allow-related", "drop", "reject"]]}}},
                    "direction": {"type": "string"},
                    "match": {"type": "string"},
                    "priority": {"type": {"key": {"type": "integer",
                        "minInteger": 0, "maxInteger": 32767}}},
                    "log": {"type": "boolean"},
                    "severity": {"type": {"key": "string", "min": 0, "max": 1}},
                    "external_ids": {"type": {"key": "string", "value": "string",
                        "min": 0, "max": "unlimited"}}
                }
            },
            "Logical_Switch": {
                "columns": {
                    "name": {"type": "string", "mutable": false},
                    "ports": {"type": {"key": {"type": "uuid",
                        "refTable": "Logical_Switch_Port", "refType": "strong"},
                        "min": 0, "max": "unlimited"}}
                }
            },
            "Logical_Switch_Port": {
                "columns": {
                    "name": {"type": "string"}
                }
            }
        }
    }"#;

    #[test]
    fn parses_atomic_set_and_map_columns() {
        let schema = DatabaseSchema::parse(SCHEMA).expect("parse");
        let acl = schema.lookup_table("ACL").expect("ACL");
        assert_eq!(acl.lookup_column("match").expect("match").kind, ColumnKind::Atomic);
        assert_eq!(
            acl.lookup_column("severity").expect("severity").kind,
            ColumnKind::Set
        );
        let ids = acl.lookup_column("external_ids").expect("external_ids");
        assert_eq!(ids.kind, ColumnKind::Map);
        assert_eq!(ids.max, None);
        let priority = acl.lookup_column("priority").expect("priority");
        assert_eq!(priority.key.max_integer, Some(32767));
        let ls = schema.lookup_table("Logical_Switch").expect("LS");
        assert!(!ls.lookup_column("name").expect("name").mutable);
        let ports = ls.lookup_column("ports").expect("ports");
        assert_eq!(ports.key.kind, BaseKind::Uuid);
        assert_eq!(ports.key.ref_table.as_deref(), Some("Logical_Switch_Port"));
    }

    #[test]
    fn default_row_fills_missing_columns() {
        let schema = DatabaseSchema::parse(SCHEMA).expect("parse");
        let acl = schema.lookup_table("ACL").expect("ACL");
        let mut row = crate::catalog::types::Row::new();
        row.insert("match".into(), Value::string("ip4"));
        acl.default_row(&mut row);
        assert_eq!(row.get("priority"), Some(&Value::integer(0)));
        assert_eq!(row.get("log"), Some(&Value::boolean(false)));
        assert_eq!(row.get("severity"), Some(&Value::Set(vec![])));
        assert_eq!(row.get("external_ids"), Some(&Value::Map(vec![])));
    }

    #[test]
    fn unmarshal_collapses_singleton_sets_for_atomic_columns() {
        let schema = DatabaseSchema::parse(SCHEMA).expect("parse");
        let acl = schema.lookup_table("ACL").expect("ACL");
        let mut row = crate::catalog::types::Row::new();
        row.insert(
            "direction".into(),
            Value::Set(vec![Atom::String("to-lport".into())]),
        );
        row.insert("severity".into(), Value::string("warning"));
        acl.unmarshal_row(&mut row).expect("unmarshal");
        assert_eq!(row.get("direction"), Some(&Value::string("to-lport")));
        assert_eq!(
            row.get("severity"),
            Some(&Value::Set(vec![Atom::String("warning".into())]))
        );
    }

    #[test]
    fn validate_enforces_cardinality_and_bounds() {
        let schema = DatabaseSchema::parse(SCHEMA).expect("parse");
        let acl = schema.lookup_table("ACL").expect("ACL");
        let mut row = crate::catalog::types::Row::new();
        row.insert(
            "severity".into(),
            Value::Set(vec![
                Atom::String("info".into()),
                Atom::String("warning".into()),
            ]),
        );
        let err = acl.validate_row(&row).expect_err("over max");
        assert_eq!(err.code(), "constraint violation");

        let mut row = crate::catalog::types::Row::new();
        row.insert("priority".into(), Value::integer(40_000));
        let err = acl.validate_row(&row).expect_err("out of bounds");
        assert_eq!(err.code(), "constraint violation");
    }

    #[test]
    fn unknown_column_is_a_constraint_violation() {
        let schema = DatabaseSchema::parse(SCHEMA).expect("parse");
        let acl = schema.lookup_table("ACL").expect("ACL");
        assert!(acl.lookup_column("nonesuch").is_err());
        assert!(acl.lookup_column("_uuid").is_ok());
    }
}
