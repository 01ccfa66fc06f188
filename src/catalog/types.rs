use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Implicit row-identity column; immutable for the row's lifetime.
pub const COL_UUID: &str = "_uuid";
/// Implicit version column; regenerated on every write.
pub const COL_VERSION: &str = "_version";

/// An atomic OVSDB datum.
///
/// `Named` is the transaction-local `uuid-name` placeholder; it only exists
/// between request parsing and named-UUID resolution and never reaches the
/// KV store.
#[derive(Debug, Clone)]
pub enum Atom {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    Uuid(Uuid),
    Named(String),
}

impl Atom {
    fn kind_rank(&self) -> u8 {
        match self {
            Atom::Boolean(_) => 0,
            Atom::Integer(_) => 1,
            Atom::Real(_) => 2,
            Atom::String(_) => 3,
            Atom::Uuid(_) => 4,
            Atom::Named(_) => 5,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Atom::Boolean(_) => "boolean",
            Atom::Integer(_) => "integer",
            Atom::Real(_) => "real",
            Atom::String(_) => "string",
            Atom::Uuid(_) => "uuid",
            Atom::Named(_) => "named-uuid",
        }
    }

    /// Decodes a JSON scalar or `["uuid",…]`/`["named-uuid",…]` pair.
    pub fn from_wire(raw: &serde_json::Value) -> Result<Atom, String> {
        match raw {
            serde_json::Value::Bool(b) => Ok(Atom::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Atom::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Atom::Real(f))
                } else {
                    Err(format!("unrepresentable number {n}"))
                }
            }
            serde_json::Value::String(s) => Ok(Atom::String(s.clone())),
            serde_json::Value::Array(pair) => {
                let [tag, body] = pair.as_slice() else {
                    return Err(format!("expected a two-element pair, got {raw}"));
                };
                let text = body
                    .as_str()
                    .ok_or_else(|| format!("uuid body must be a string, got {body}"))?;
                match tag.as_str() {
                    // A syntactically invalid uuid is a named placeholder.
                    Some("uuid") => Ok(Uuid::parse_str(text)
                        .map(Atom::Uuid)
                        .unwrap_or_else(|_| Atom::Named(text.to_string()))),
                    Some("named-uuid") => Ok(Atom::Named(text.to_string())),
                    _ => Err(format!("unknown atom tag in {raw}")),
                }
            }
            other => Err(format!("not an atom: {other}")),
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Atom::Integer(i) => serde_json::Value::from(*i),
            Atom::Real(f) => serde_json::Value::from(*f),
            Atom::Boolean(b) => serde_json::Value::from(*b),
            Atom::String(s) => serde_json::Value::from(s.clone()),
            Atom::Uuid(u) => serde_json::json!(["uuid", u.to_string()]),
            Atom::Named(n) => serde_json::json!(["named-uuid", n.clone()]),
        }
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Atom {}

impl PartialOrd for Atom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Atom {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }
        match (self, other) {
            (Atom::Boolean(a), Atom::Boolean(b)) => a.cmp(b),
            (Atom::Integer(a), Atom::Integer(b)) => a.cmp(b),
            (Atom::Real(a), Atom::Real(b)) => a.total_cmp(b),
            (Atom::String(a), Atom::String(b)) => a.cmp(b),
            (Atom::Uuid(a), Atom::Uuid(b)) => a.cmp(b),
            (Atom::Named(a), Atom::Named(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// A column value: an atom, a set of atoms, or an atom-to-atom map.
///
/// Sets and maps compare order-insensitively; `TableSchema::unmarshal_row`
/// keeps them in sorted canonical form so repeated comparisons stay cheap.
#[derive(Debug, Clone)]
pub enum Value {
    Atom(Atom),
    Set(Vec<Atom>),
    Map(Vec<(Atom, Atom)>),
}

/// A row keyed by column name, `_uuid` and `_version` included.
pub type Row = BTreeMap<String, Value>;

impl Value {
    pub fn integer(i: i64) -> Value {
        Value::Atom(Atom::Integer(i))
    }

    pub fn real(f: f64) -> Value {
        Value::Atom(Atom::Real(f))
    }

    pub fn boolean(b: bool) -> Value {
        Value::Atom(Atom::Boolean(b))
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::Atom(Atom::String(s.into()))
    }

    pub fn uuid(u: Uuid) -> Value {
        Value::Atom(Atom::Uuid(u))
    }

    pub fn named(n: impl Into<String>) -> Value {
        Value::Atom(Atom::Named(n.into()))
    }

    pub fn set(atoms: Vec<Atom>) -> Value {
        Value::Set(atoms)
    }

    pub fn map(entries: Vec<(Atom, Atom)>) -> Value {
        Value::Map(entries)
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Value::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Vec<Atom>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Vec<(Atom, Atom)>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Atom(Atom::Uuid(u)) => Some(*u),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Atom(a) => a.type_name(),
            Value::Set(_) => "set",
            Value::Map(_) => "map",
        }
    }

    /// Decodes the loosely typed RFC 7047 JSON form.
    pub fn from_wire(raw: &serde_json::Value) -> Result<Value, String> {
        if let serde_json::Value::Array(parts) = raw {
            let tag = parts.first().and_then(|t| t.as_str());
            match tag {
                Some("set") => {
                    let body = parts
                        .get(1)
                        .and_then(|b| b.as_array())
                        .ok_or_else(|| format!("malformed set {raw}"))?;
                    let atoms = body
                        .iter()
                        .map(Atom::from_wire)
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Value::Set(atoms));
                }
                Some("map") => {
                    let body = parts
                        .get(1)
                        .and_then(|b| b.as_array())
                        .ok_or_else(|| format!("malformed map {raw}"))?;
                    let mut entries = Vec::with_capacity(body.len());
                    for pair in body {
                        let kv = pair
                            .as_array()
                            .filter(|kv| kv.len() == 2)
                            .ok_or_else(|| format!("malformed map entry {pair}"))?;
                        entries.push((Atom::from_wire(&kv[0])?, Atom::from_wire(&kv[1])?));
                    }
                    return Ok(Value::Map(entries));
                }
                _ => {}
            }
        }
        Atom::from_wire(raw).map(Value::Atom)
    }

    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Value::Atom(a) => a.to_wire(),
            Value::Set(atoms) => {
                let body: Vec<serde_json::Value> = atoms.iter().map(Atom::to_wire).collect();
                serde_json::json!(["set", body])
            }
            Value::Map(entries) => {
                let body: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|(k, v)| serde_json::json!([k.to_wire(), v.to_wire()]))
                    .collect();
                serde_json::json!(["map", body])
            }
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Atom(_) => 0,
            Value::Set(_) => 1,
            Value::Map(_) => 2,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }
        match (self, other) {
            (Value::Atom(a), Value::Atom(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort();
                b.sort();
                a.cmp(&b)
            }
            (Value::Map(a), Value::Map(b)) => {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort();
                b.sort();
                a.cmp(&b)
            }
            _ => Ordering::Equal,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::from_wire(&raw).map_err(serde::de::Error::custom)
    }
}

pub fn set_row_uuid(row: &mut Row, uuid: Uuid) {
    row.insert(COL_UUID.to_string(), Value::uuid(uuid));
}

pub fn set_row_version(row: &mut Row) {
    row.insert(COL_VERSION.to_string(), Value::uuid(Uuid::new_v4()));
}

/// Projects a row down to the requested columns; `None` keeps everything.
pub fn reduce_row_by_columns(row: &Row, columns: Option<&Vec<String>>) -> Row {
    match columns {
        None => row.clone(),
        Some(cols) => cols
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect(),
    }
}

/// Renders a row as the JSON object stored under its data key.
pub fn row_to_json(row: &Row) -> Result<String, String> {
    serde_json::to_string(row).map_err(|e| e.to_string())
}

pub fn row_from_json(data: &str) -> Result<Row, String> {
    serde_json::from_str(data).map_err(|e| e.to_string())
}
