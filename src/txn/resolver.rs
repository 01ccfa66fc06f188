use crate::catalog::types::{Atom, Row, Value};
use crate::error::OvsdbError;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// Per-transaction mapping of `uuid-name` tokens to real UUIDs.
#[derive(Debug, Default)]
pub struct NamedUuidResolver {
    bindings: BTreeMap<String, Uuid>,
}

impl NamedUuidResolver {
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn set(&mut self, name: &str, uuid: Uuid) {
        debug!(uuid_name = name, %uuid, "bind named-uuid");
        self.bindings.insert(name.to_string(), uuid);
    }

    pub fn get(&self, name: &str) -> Result<Uuid, OvsdbError> {
        self.bindings.get(name).copied().ok_or_else(|| {
            OvsdbError::ConstraintViolation(format!("unknown uuid-name {name}"))
        })
    }

    fn resolve_atom(&self, atom: Atom) -> Result<Atom, OvsdbError> {
        match atom {
            Atom::Named(name) => self.get(&name).map(Atom::Uuid),
            other => Ok(other),
        }
    }

    /// Replaces every named placeholder in the value with its bound UUID,
    /// recursing into sets and maps.
    pub fn resolve(&self, value: Value) -> Result<Value, OvsdbError> {
        match value {
            Value::Atom(a) => self.resolve_atom(a).map(Value::Atom),
            Value::Set(atoms) => atoms
                .into_iter()
                .map(|a| self.resolve_atom(a))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Set),
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((self.resolve_atom(k)?, self.resolve_atom(v)?)))
                .collect::<Result<Vec<_>, OvsdbError>>()
                .map(Value::Map),
        }
    }

    pub fn resolve_row(&self, row: &mut Row) -> Result<(), OvsdbError> {
        let columns: Vec<String> = row.keys().cloned().collect();
        for column in columns {
            let value = row.remove(&column).expect("column just enumerated");
            row.insert(column, self.resolve(value)?);
        }
        Ok(())
    }
}
