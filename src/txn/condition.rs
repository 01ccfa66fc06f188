use crate::catalog::schema::{ColumnKind, ColumnSchema, TableSchema};
use crate::catalog::types::{Atom, COL_UUID, Row, Value};
use crate::error::OvsdbError;
use crate::txn::resolver::NamedUuidResolver;
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionFunction {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Includes,
    Excludes,
    In,
}

impl ConditionFunction {
    fn parse(text: &str) -> Result<ConditionFunction, OvsdbError> {
        match text {
            "==" => Ok(ConditionFunction::Eq),
            "!=" => Ok(ConditionFunction::Ne),
            "<" => Ok(ConditionFunction::Lt),
            "<=" => Ok(ConditionFunction::Le),
            ">" => Ok(ConditionFunction::Gt),
            ">=" => Ok(ConditionFunction::Ge),
            "includes" => Ok(ConditionFunction::Includes),
            "excludes" => Ok(ConditionFunction::Excludes),
            "in" => Ok(ConditionFunction::In),
            other => Err(OvsdbError::ConstraintViolation(format!(
                "unknown condition function {other}"
            ))),
        }
    }

    fn is_relational(self) -> bool {
        matches!(
            self,
            ConditionFunction::Lt
                | ConditionFunction::Le
                | ConditionFunction::Gt
                | ConditionFunction::Ge
        )
    }
}

/// A validated `[column, function, value]` predicate bound to its column
/// schema. Construction resolves named UUIDs and rejects functions the
/// column type does not admit.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub function: ConditionFunction,
    pub value: Value,
}

impl Condition {
    pub fn new(
        table_schema: &TableSchema,
        resolver: &NamedUuidResolver,
        raw: &serde_json::Value,
    ) -> Result<Condition, OvsdbError> {
        let parts = raw.as_array().filter(|p| p.len() == 3).ok_or_else(|| {
            OvsdbError::Internal(format!("condition is not a three-element array: {raw}"))
        })?;
        let column = parts[0]
            .as_str()
            .ok_or_else(|| {
                OvsdbError::Internal(format!("condition column is not a string: {}", parts[0]))
            })?
            .to_string();
        let column_schema = table_schema.lookup_column(&column)?;
        let function = ConditionFunction::parse(parts[1].as_str().unwrap_or_default())?;
        let value = decode_operand(column_schema, resolver, &parts[2], function)?;
        if function.is_relational()
            && !(column_schema.kind == ColumnKind::Atomic && column_schema.key.kind.is_numeric())
        {
            return Err(OvsdbError::ConstraintViolation(format!(
                "relational condition on non-numeric column {column}"
            )));
        }
        Ok(Condition {
            column,
            function,
            value,
        })
    }

    /// Whether the row satisfies this predicate. A column missing from the
    /// row only satisfies the negated functions.
    pub fn matches(&self, row: &Row) -> Result<bool, OvsdbError> {
        let Some(actual) = row.get(&self.column) else {
            return Ok(matches!(
                self.function,
                ConditionFunction::Ne | ConditionFunction::Excludes
            ));
        };
        match self.function {
            // Value equality is already order-insensitive for sets and maps
            ConditionFunction::Eq => Ok(self.value == *actual),
            ConditionFunction::Ne => Ok(self.value != *actual),
            ConditionFunction::Includes => Ok(is_includes(&self.value, actual)),
            ConditionFunction::Excludes => Ok(!is_includes(&self.value, actual)),
            ConditionFunction::In => Ok(is_member(&self.value, actual)),
            ConditionFunction::Lt => relational(actual, &self.value, Ordering::is_lt),
            ConditionFunction::Le => relational(actual, &self.value, Ordering::is_le),
            ConditionFunction::Gt => relational(actual, &self.value, Ordering::is_gt),
            ConditionFunction::Ge => relational(actual, &self.value, Ordering::is_ge),
        }
    }

    /// The concrete row UUID this condition pins, when it is
    /// `["_uuid", "==", <uuid>]` (or the `in` form). Lets the pre-phase
    /// fetch one key instead of the whole table.
    pub fn pinned_uuid(&self) -> Option<Uuid> {
        if self.column != COL_UUID {
            return None;
        }
        if !matches!(self.function, ConditionFunction::Eq | ConditionFunction::In) {
            return None;
        }
        self.value.as_uuid()
    }
}

fn decode_operand(
    column_schema: &ColumnSchema,
    resolver: &NamedUuidResolver,
    raw: &serde_json::Value,
    function: ConditionFunction,
) -> Result<Value, OvsdbError> {
    let decoded = Value::from_wire(raw)
        .map_err(|e| OvsdbError::ConstraintViolation(format!("condition value: {e}")))?;
    let resolved = resolver.resolve(decoded)?;
    // `in` compares the column atom against a set operand, so the operand
    // intentionally escapes the column's own shape.
    if function == ConditionFunction::In {
        return Ok(resolved);
    }
    column_schema
        .normalize(resolved)
        .map_err(|e| OvsdbError::ConstraintViolation(format!("condition value: {e}")))
}

fn relational(
    actual: &Value,
    expected: &Value,
    ok: impl Fn(Ordering) -> bool,
) -> Result<bool, OvsdbError> {
    match (actual.as_atom(), expected.as_atom()) {
        (Some(a), Some(b)) => Ok(ok(numeric_cmp(a, b)?)),
        _ => Err(OvsdbError::ConstraintViolation(
            "relational comparison on non-atomic value".into(),
        )),
    }
}

fn numeric_cmp(a: &Atom, b: &Atom) -> Result<Ordering, OvsdbError> {
    match (a, b) {
        (Atom::Integer(a), Atom::Integer(b)) => Ok(a.cmp(b)),
        (Atom::Real(a), Atom::Real(b)) => Ok(a.total_cmp(b)),
        (Atom::Integer(a), Atom::Real(b)) => Ok((*a as f64).total_cmp(b)),
        (Atom::Real(a), Atom::Integer(b)) => Ok(a.total_cmp(&(*b as f64))),
        _ => Err(OvsdbError::ConstraintViolation(
            "relational comparison on non-numeric atoms".into(),
        )),
    }
}

fn is_includes(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Set(want), Value::Set(have)) => want
            .iter()
            .all(|w| have.iter().any(|h| h == w)),
        (Value::Map(want), Value::Map(have)) => want.iter().all(|(wk, wv)| {
            have.iter()
                .any(|(hk, hv)| hk == wk && map_values_equal(wv, hv))
        }),
        // scalars behave as single-element sets
        (Value::Atom(w), Value::Atom(h)) => w == h,
        (Value::Atom(w), Value::Set(have)) => have.iter().any(|h| h == w),
        (Value::Set(want), Value::Atom(h)) => want.iter().all(|w| w == h),
        _ => false,
    }
}

fn is_member(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Set(want), Value::Atom(h)) => want.iter().any(|w| w == h),
        _ => expected == actual,
    }
}

/// Some deployed map values are strings that themselves encode
/// comma-separated lists; those compare equal regardless of token order.
fn map_values_equal(expected: &Atom, actual: &Atom) -> bool {
    if let (Atom::String(e), Atom::String(a)) = (expected, actual) {
        return split_and_sort(e) == split_and_sort(a);
    }
    expected == actual
}

/// Splits on commas and rejoins in alphabetic order: case-insensitive
/// first, exact spelling as the tie-break.
fn split_and_sort(text: &str) -> String {
    let mut tokens: Vec<&str> = text.split(',').collect();
    tokens.sort_by(|a, b| {
        let (la, lb) = (a.to_lowercase(), b.to_lowercase());
        if la == lb { a.cmp(b) } else { la.cmp(&lb) }
    });
    tokens.concat()
}

/// Whether the row satisfies every condition of a `where` clause; an absent
/// clause matches everything.
pub fn row_matches_where(
    table_schema: &TableSchema,
    resolver: &NamedUuidResolver,
    row: &Row,
    where_: Option<&Vec<serde_json::Value>>,
) -> Result<bool, OvsdbError> {
    let Some(conditions) = where_ else {
        return Ok(true);
    };
    for raw in conditions {
        let condition = Condition::new(table_schema, resolver, raw)?;
        if !condition.matches(row)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Scans a `where` clause for a pinned `_uuid`, for prefetch narrowing.
pub fn where_pinned_uuid(
    table_schema: &TableSchema,
    resolver: &NamedUuidResolver,
    where_: Option<&Vec<serde_json::Value>>,
) -> Result<Option<Uuid>, OvsdbError> {
    let Some(conditions) = where_ else {
        return Ok(None);
    };
    for raw in conditions {
        let condition = Condition::new(table_schema, resolver, raw)?;
        if let Some(uuid) = condition.pinned_uuid() {
            return Ok(Some(uuid));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{Condition, row_matches_where, split_and_sort, where_pinned_uuid};
    use crate::catalog::schema::DatabaseSchema;
    use crate::catalog::types::{Atom, Row, Value};
    use crate::txn::resolver::NamedUuidResolver;
    use serde_json::json;
    use uuid::Uuid;

    const SCHEMA: &str = r#"{
        "name": "nb",
        "tables": {
            "ACL": {
                "columns": {
                    "match": {"type": "string"},
                    "priority": {"type": "integer"},
                    "severity": {"type": {"key": "string", "min": 0, "max": 1}},
                    "external_ids": {"type": {"key": "string", "value": "string",
                        "min": 0, "max": "unlimited"}}
                }
            }
        }
    }"#;

    fn acl_row() -> Row {
        let mut row = Row::new();
        row.insert("match".into(), Value::string("ip4.src==10.0.0.1"));
        row.insert("priority".into(), Value::integer(1001));
        row.insert(
            "severity".into(),
            Value::Set(vec![Atom::String("warning".into())]),
        );
        row.insert(
            "external_ids".into(),
            Value::Map(vec![(
                Atom::String("owner".into()),
                Atom::String("b,a,c".into()),
            )]),
        );
        row
    }

    fn schema() -> DatabaseSchema {
        DatabaseSchema::parse(SCHEMA).expect("schema")
    }

    #[test]
    fn scalar_and_relational_comparisons() {
        let schema = schema();
        let table = schema.lookup_table("ACL").expect("table");
        let resolver = NamedUuidResolver::default();
        let row = acl_row();

        for (cond, expected) in [
            (json!(["priority", "==", 1001]), true),
            (json!(["priority", "!=", 1001]), false),
            (json!(["priority", "<", 2000]), true),
            (json!(["priority", ">=", 1001]), true),
            (json!(["priority", ">", 1001]), false),
            (json!(["match", "==", "ip4.src==10.0.0.1"]), true),
        ] {
            let condition = Condition::new(table, &resolver, &cond).expect("condition");
            assert_eq!(condition.matches(&row).expect("matches"), expected, "{cond}");
        }
    }

    #[test]
    fn relational_on_string_column_is_rejected() {
        let schema = schema();
        let table = schema.lookup_table("ACL").expect("table");
        let resolver = NamedUuidResolver::default();
        let err =
            Condition::new(table, &resolver, &json!(["match", "<", "x"])).expect_err("rejected");
        assert_eq!(err.code(), "constraint violation");
    }

    #[test]
    fn includes_on_sets_and_maps() {
        let schema = schema();
        let table = schema.lookup_table("ACL").expect("table");
        let resolver = NamedUuidResolver::default();
        let row = acl_row();

        let includes =
            json!(["severity", "includes", ["set", ["warning"]]]);
        let condition = Condition::new(table, &resolver, &includes).expect("condition");
        assert!(condition.matches(&row).expect("matches"));

        let excludes = json!(["severity", "excludes", ["set", ["info"]]]);
        let condition = Condition::new(table, &resolver, &excludes).expect("condition");
        assert!(condition.matches(&row).expect("matches"));

        let map_includes =
            json!(["external_ids", "includes", ["map", [["owner", "a,b,c"]]]]);
        let condition = Condition::new(table, &resolver, &map_includes).expect("condition");
        assert!(
            condition.matches(&row).expect("matches"),
            "comma-list values compare sorted"
        );
    }

    #[test]
    fn where_order_does_not_matter() {
        let schema = schema();
        let table = schema.lookup_table("ACL").expect("table");
        let resolver = NamedUuidResolver::default();
        let row = acl_row();
        let forward = vec![
            json!(["priority", "==", 1001]),
            json!(["match", "==", "ip4.src==10.0.0.1"]),
        ];
        let reversed: Vec<_> = forward.iter().cloned().rev().collect();
        assert!(row_matches_where(table, &resolver, &row, Some(&forward)).expect("fwd"));
        assert!(row_matches_where(table, &resolver, &row, Some(&reversed)).expect("rev"));
    }

    #[test]
    fn pinned_uuid_narrows_prefetch() {
        let schema = schema();
        let table = schema.lookup_table("ACL").expect("table");
        let mut resolver = NamedUuidResolver::default();
        let bound = Uuid::new_v4();
        resolver.set("a", bound);
        let where_ = vec![json!(["_uuid", "==", ["named-uuid", "a"]])];
        assert_eq!(
            where_pinned_uuid(table, &resolver, Some(&where_)).expect("pin"),
            Some(bound)
        );
        let unpinned = vec![json!(["priority", "==", 1])];
        assert_eq!(
            where_pinned_uuid(table, &resolver, Some(&unpinned)).expect("pin"),
            None
        );
    }

    #[test]
    fn split_and_sort_is_case_insensitive_with_exact_tie_break() {
        assert_eq!(split_and_sort("b,a,c"), "abc");
        assert_eq!(split_and_sort("B,a"), "aB");
        assert_eq!(split_and_sort("b,B"), "Bb");
    }
}
