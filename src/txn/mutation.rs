use crate::catalog::schema::{BaseKind, ColumnKind, ColumnSchema, TableSchema};
use crate::catalog::types::{Atom, COL_UUID, COL_VERSION, Row, Value};
use crate::error::OvsdbError;
use crate::txn::resolver::NamedUuidResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutator {
    Sum,
    Difference,
    Product,
    Quotient,
    Remainder,
    Insert,
    Delete,
}

impl Mutator {
    fn parse(text: &str) -> Result<Mutator, OvsdbError> {
        match text {
            "+=" => Ok(Mutator::Sum),
            "-=" => Ok(Mutator::Difference),
            "*=" => Ok(Mutator::Product),
            "/=" => Ok(Mutator::Quotient),
            "%=" => Ok(Mutator::Remainder),
            "insert" => Ok(Mutator::Insert),
            "delete" => Ok(Mutator::Delete),
            other => Err(OvsdbError::ConstraintViolation(format!(
                "unknown mutator {other}"
            ))),
        }
    }

    fn is_arithmetic(self) -> bool {
        !matches!(self, Mutator::Insert | Mutator::Delete)
    }
}

/// What a map `delete` mutation removes.
#[derive(Debug, Clone)]
enum MapDeletion {
    Keys(Vec<Atom>),
    Pairs(Vec<(Atom, Atom)>),
}

/// A validated `[column, mutator, value]` triple. Construction enforces
/// mutability and that the mutator fits the column type; `apply` performs
/// the in-place change.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub column: String,
    pub mutator: Mutator,
    operand: Value,
    kind: ColumnKind,
    schema: ColumnSchema,
}

impl Mutation {
    pub fn new(
        table_schema: &TableSchema,
        resolver: &NamedUuidResolver,
        raw: &serde_json::Value,
    ) -> Result<Mutation, OvsdbError> {
        let parts = raw.as_array().filter(|p| p.len() == 3).ok_or_else(|| {
            OvsdbError::Internal(format!("mutation is not a three-element array: {raw}"))
        })?;
        let column = parts[0]
            .as_str()
            .ok_or_else(|| {
                OvsdbError::Internal(format!("mutation column is not a string: {}", parts[0]))
            })?
            .to_string();
        if column == COL_UUID || column == COL_VERSION {
            return Err(OvsdbError::ConstraintViolation(format!(
                "mutation of implicit column {column}"
            )));
        }
        let column_schema = table_schema.lookup_column(&column)?;
        if !column_schema.mutable {
            return Err(OvsdbError::ConstraintViolation(format!(
                "mutation of immutable column {column}"
            )));
        }
        let mutator = Mutator::parse(parts[1].as_str().unwrap_or_default())?;
        let operand = Value::from_wire(&parts[2])
            .map_err(|e| OvsdbError::ConstraintViolation(format!("mutation value: {e}")))?;
        let operand = resolver.resolve(operand)?;

        if mutator.is_arithmetic() {
            if column_schema.kind != ColumnKind::Atomic || !column_schema.key.kind.is_numeric() {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "arithmetic mutation on non-numeric column {column}"
                )));
            }
            if mutator == Mutator::Remainder && column_schema.key.kind != BaseKind::Integer {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "remainder mutation on non-integer column {column}"
                )));
            }
            let ok = matches!(
                operand.as_atom(),
                Some(Atom::Integer(_) | Atom::Real(_))
            );
            if !ok {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "arithmetic mutation of {column} needs a numeric operand"
                )));
            }
        } else if column_schema.kind == ColumnKind::Atomic {
            return Err(OvsdbError::ConstraintViolation(format!(
                "{} mutation on atomic column {column}",
                parts[1].as_str().unwrap_or_default()
            )));
        }

        Ok(Mutation {
            column,
            mutator,
            operand,
            kind: column_schema.kind,
            schema: column_schema.clone(),
        })
    }

    pub fn apply(&self, row: &mut Row) -> Result<(), OvsdbError> {
        let current = row
            .entry(self.column.clone())
            .or_insert_with(|| self.schema.default_value());
        match self.kind {
            ColumnKind::Atomic => self.apply_arithmetic(current),
            ColumnKind::Set => self.apply_set(current),
            ColumnKind::Map => self.apply_map(current),
        }
    }

    fn apply_arithmetic(&self, current: &mut Value) -> Result<(), OvsdbError> {
        let operand = self.operand.as_atom().expect("validated at construction");
        let result = match current.as_atom() {
            Some(Atom::Integer(lhs)) => Atom::Integer(integer_arith(
                &self.column,
                self.mutator,
                *lhs,
                operand,
            )?),
            Some(Atom::Real(lhs)) => {
                Atom::Real(real_arith(&self.column, self.mutator, *lhs, operand)?)
            }
            _ => {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "arithmetic mutation of non-numeric value in column {}",
                    self.column
                )));
            }
        };
        if let Atom::Integer(i) = result {
            let b = &self.schema.key;
            if b.min_integer.is_some_and(|min| i < min) || b.max_integer.is_some_and(|max| i > max)
            {
                return Err(OvsdbError::Range(format!(
                    "mutation result {i} outside bounds of column {}",
                    self.column
                )));
            }
        }
        if let Atom::Real(f) = result {
            let b = &self.schema.key;
            if !f.is_finite()
                || b.min_real.is_some_and(|min| f < min)
                || b.max_real.is_some_and(|max| f > max)
            {
                return Err(OvsdbError::Range(format!(
                    "mutation result {f} outside bounds of column {}",
                    self.column
                )));
            }
        }
        *current = Value::Atom(result);
        Ok(())
    }

    fn apply_set(&self, current: &mut Value) -> Result<(), OvsdbError> {
        let atoms = match current {
            Value::Set(atoms) => atoms,
            _ => {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "set mutation of non-set value in column {}",
                    self.column
                )));
            }
        };
        let operand_atoms: Vec<Atom> = match &self.operand {
            Value::Set(s) => s.clone(),
            Value::Atom(a) => vec![a.clone()],
            Value::Map(_) => {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "set mutation of column {} with a map operand",
                    self.column
                )));
            }
        };
        match self.mutator {
            Mutator::Insert => {
                // union; inserting a present element is a no-op
                for atom in operand_atoms {
                    if !atoms.contains(&atom) {
                        atoms.push(atom);
                    }
                }
                atoms.sort();
            }
            Mutator::Delete => atoms.retain(|a| !operand_atoms.contains(a)),
            _ => unreachable!("validated at construction"),
        }
        Ok(())
    }

    fn apply_map(&self, current: &mut Value) -> Result<(), OvsdbError> {
        let entries = match current {
            Value::Map(entries) => entries,
            _ => {
                return Err(OvsdbError::ConstraintViolation(format!(
                    "map mutation of non-map value in column {}",
                    self.column
                )));
            }
        };
        match self.mutator {
            Mutator::Insert => {
                let Value::Map(additions) = &self.operand else {
                    return Err(OvsdbError::ConstraintViolation(format!(
                        "map insert on column {} needs a map operand",
                        self.column
                    )));
                };
                // only keys not already present are added
                for (k, v) in additions {
                    if !entries.iter().any(|(ek, _)| ek == k) {
                        entries.push((k.clone(), v.clone()));
                    }
                }
                entries.sort();
            }
            Mutator::Delete => {
                match self.map_deletion()? {
                    MapDeletion::Keys(keys) => {
                        entries.retain(|(k, _)| !keys.contains(k));
                    }
                    MapDeletion::Pairs(pairs) => {
                        entries.retain(|(k, v)| {
                            !pairs.iter().any(|(pk, pv)| pk == k && pv == v)
                        });
                    }
                }
            }
            _ => unreachable!("validated at construction"),
        }
        Ok(())
    }

    fn map_deletion(&self) -> Result<MapDeletion, OvsdbError> {
        match &self.operand {
            Value::Map(pairs) => Ok(MapDeletion::Pairs(pairs.clone())),
            Value::Set(keys) => Ok(MapDeletion::Keys(keys.clone())),
            Value::Atom(key) => Ok(MapDeletion::Keys(vec![key.clone()])),
        }
    }
}

fn integer_arith(
    column: &str,
    mutator: Mutator,
    lhs: i64,
    operand: &Atom,
) -> Result<i64, OvsdbError> {
    let rhs = match operand {
        Atom::Integer(i) => *i,
        Atom::Real(f) if f.fract() == 0.0 => *f as i64,
        _ => {
            return Err(OvsdbError::ConstraintViolation(format!(
                "integer mutation of column {column} with non-integer operand"
            )));
        }
    };
    let result = match mutator {
        Mutator::Sum => lhs.checked_add(rhs),
        Mutator::Difference => lhs.checked_sub(rhs),
        Mutator::Product => lhs.checked_mul(rhs),
        Mutator::Quotient => {
            if rhs == 0 {
                return Err(OvsdbError::Domain(format!(
                    "division of column {column} by zero"
                )));
            }
            lhs.checked_div(rhs)
        }
        Mutator::Remainder => {
            if rhs == 0 {
                return Err(OvsdbError::Domain(format!(
                    "remainder of column {column} by zero"
                )));
            }
            lhs.checked_rem(rhs)
        }
        _ => unreachable!("arithmetic mutator"),
    };
    result.ok_or_else(|| OvsdbError::Range(format!("integer overflow mutating column {column}")))
}

fn real_arith(column: &str, mutator: Mutator, lhs: f64, operand: &Atom) -> Result<f64, OvsdbError> {
    let rhs = match operand {
        Atom::Real(f) => *f,
        Atom::Integer(i) => *i as f64,
        _ => {
            return Err(OvsdbError::ConstraintViolation(format!(
                "real mutation of column {column} with non-numeric operand"
            )));
        }
    };
    match mutator {
        Mutator::Sum => Ok(lhs + rhs),
        Mutator::Difference => Ok(lhs - rhs),
        Mutator::Product => Ok(lhs * rhs),
        Mutator::Quotient => {
            if rhs == 0.0 {
                return Err(OvsdbError::Domain(format!(
                    "division of column {column} by zero"
                )));
            }
            Ok(lhs / rhs)
        }
        _ => unreachable!("remainder rejected for reals at construction"),
    }
}

#[cfg(test)]
mod tests {
    use super::Mutation;
    use crate::catalog::schema::DatabaseSchema;
    use crate::catalog::types::{Atom, Row, Value};
    use crate::txn::resolver::NamedUuidResolver;
    use serde_json::json;

    const SCHEMA: &str = r#"{
        "name": "nb",
        "tables": {
            "Address_Set": {
                "columns": {
                    "name": {"type": "string", "mutable": false},
                    "addresses": {"type": {"key": "string", "min": 0, "max": "unlimited"}},
                    "external_ids": {"type": {"key": "string", "value": "string",
                        "min": 0, "max": "unlimited"}},
                    "refcount": {"type": {"key": {"type": "integer",
                        "minInteger": 0, "maxInteger": 1000}}}
                }
            }
        }
    }"#;

    fn table() -> crate::catalog::schema::TableSchema {
        DatabaseSchema::parse(SCHEMA)
            .expect("schema")
            .lookup_table("Address_Set")
            .expect("table")
            .clone()
    }

    fn base_row() -> Row {
        let mut row = Row::new();
        row.insert("name".into(), Value::string("kube-system_v4"));
        row.insert(
            "addresses".into(),
            Value::Set(vec![Atom::String("10.244.0.2".into())]),
        );
        row.insert("external_ids".into(), Value::Map(vec![]));
        row.insert("refcount".into(), Value::integer(2));
        row
    }

    fn mutate(row: &mut Row, raw: serde_json::Value) -> Result<(), crate::error::OvsdbError> {
        let table = table();
        let resolver = NamedUuidResolver::default();
        Mutation::new(&table, &resolver, &raw)?.apply(row)
    }

    #[test]
    fn set_insert_appends_and_is_idempotent() {
        let mut row = base_row();
        mutate(&mut row, json!(["addresses", "insert", "10.244.0.5"])).expect("insert");
        assert_eq!(
            row.get("addresses").expect("set").as_set().expect("set").len(),
            2
        );
        mutate(&mut row, json!(["addresses", "insert", "10.244.0.5"])).expect("again");
        assert_eq!(
            row.get("addresses").expect("set").as_set().expect("set").len(),
            2,
            "re-inserting a present element leaves cardinality alone"
        );
    }

    #[test]
    fn set_delete_removes_matches() {
        let mut row = base_row();
        mutate(
            &mut row,
            json!(["addresses", "delete", ["set", ["10.244.0.2"]]]),
        )
        .expect("delete");
        assert_eq!(row.get("addresses"), Some(&Value::Set(vec![])));
    }

    #[test]
    fn map_insert_skips_existing_keys_and_delete_takes_keys_or_pairs() {
        let mut row = base_row();
        mutate(
            &mut row,
            json!(["external_ids", "insert", ["map", [["a", "1"], ["b", "2"]]]]),
        )
        .expect("insert");
        mutate(
            &mut row,
            json!(["external_ids", "insert", ["map", [["a", "other"]]]]),
        )
        .expect("existing key untouched");
        let ids = row.get("external_ids").expect("map").as_map().expect("map");
        assert!(ids.contains(&(Atom::String("a".into()), Atom::String("1".into()))));

        mutate(&mut row, json!(["external_ids", "delete", ["set", ["a"]]])).expect("by key");
        mutate(
            &mut row,
            json!(["external_ids", "delete", ["map", [["b", "wrong"]]]]),
        )
        .expect("pair mismatch");
        let ids = row.get("external_ids").expect("map").as_map().expect("map");
        assert_eq!(ids.len(), 1, "mismatched pair deletion is a no-op");
        mutate(
            &mut row,
            json!(["external_ids", "delete", ["map", [["b", "2"]]]]),
        )
        .expect("pair match");
        assert_eq!(row.get("external_ids"), Some(&Value::Map(vec![])));
    }

    #[test]
    fn arithmetic_with_domain_and_range_errors() {
        let mut row = base_row();
        mutate(&mut row, json!(["refcount", "+=", 3])).expect("sum");
        assert_eq!(row.get("refcount"), Some(&Value::integer(5)));
        mutate(&mut row, json!(["refcount", "*=", 4])).expect("product");
        assert_eq!(row.get("refcount"), Some(&Value::integer(20)));
        mutate(&mut row, json!(["refcount", "/=", 5])).expect("quotient");
        assert_eq!(row.get("refcount"), Some(&Value::integer(4)));
        mutate(&mut row, json!(["refcount", "%=", 3])).expect("remainder");
        assert_eq!(row.get("refcount"), Some(&Value::integer(1)));

        let err = mutate(&mut row, json!(["refcount", "/=", 0])).expect_err("by zero");
        assert_eq!(err.code(), "domain error");
        let err = mutate(&mut row, json!(["refcount", "+=", 5000])).expect_err("over bounds");
        assert_eq!(err.code(), "range error");
    }

    #[test]
    fn immutable_and_implicit_columns_are_rejected() {
        let mut row = base_row();
        let err = mutate(&mut row, json!(["name", "insert", "x"])).expect_err("immutable");
        assert_eq!(err.code(), "constraint violation");
        let err = mutate(&mut row, json!(["_uuid", "+=", 1])).expect_err("implicit");
        assert_eq!(err.code(), "constraint violation");
        let err = mutate(&mut row, json!(["refcount", "insert", 1])).expect_err("atomic insert");
        assert_eq!(err.code(), "constraint violation");
    }
}
