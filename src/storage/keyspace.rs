use std::fmt;

/// Root prefix shared by every key this server writes.
pub const ROOT_PREFIX: &str = "ovsdb";

const LOCKS_SEGMENT: &str = "_locks";
const COMMENTS_SEGMENT: &str = "_comments";

/// A location in the flat KV keyspace. Prefix forms carry a trailing slash
/// so that range queries never bleed into sibling names (`db/AC/` does not
/// match `db/ACL/...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// `<root>/<db>/<table>/<uuid>`: one JSON-encoded row.
    Data {
        db: String,
        table: String,
        uuid: String,
    },
    /// `<root>/<db>/<table>/`: all rows of a table.
    Table { db: String, table: String },
    /// `<root>/<db>/`: all rows of a database.
    Db { db: String },
    /// `<root>/_locks/<id>`: distributed mutex anchor.
    Lock { id: String },
    /// `<root>/_comments/<db>/<rfc3339>`: append log of user comments.
    Comment { db: String, timestamp: String },
}

impl Key {
    pub fn data(db: impl Into<String>, table: impl Into<String>, uuid: impl Into<String>) -> Key {
        Key::Data {
            db: db.into(),
            table: table.into(),
            uuid: uuid.into(),
        }
    }

    pub fn table(db: impl Into<String>, table: impl Into<String>) -> Key {
        Key::Table {
            db: db.into(),
            table: table.into(),
        }
    }

    pub fn db(db: impl Into<String>) -> Key {
        Key::Db { db: db.into() }
    }

    pub fn lock(id: impl Into<String>) -> Key {
        Key::Lock { id: id.into() }
    }

    pub fn comment(db: impl Into<String>, timestamp: impl Into<String>) -> Key {
        Key::Comment {
            db: db.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Decodes a data key into `(db, table, uuid)`. Lock and comment keys,
    /// and anything outside the root prefix, yield `None`.
    pub fn parse_data(key: &str) -> Option<(&str, &str, &str)> {
        let rest = key.strip_prefix(ROOT_PREFIX)?.strip_prefix('/')?;
        let mut parts = rest.splitn(3, '/');
        let db = parts.next()?;
        let table = parts.next()?;
        let uuid = parts.next()?;
        if db.is_empty() || table.is_empty() || uuid.is_empty() || uuid.contains('/') {
            return None;
        }
        if db == LOCKS_SEGMENT || db == COMMENTS_SEGMENT {
            return None;
        }
        Some((db, table, uuid))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Data { db, table, uuid } => {
                write!(f, "{ROOT_PREFIX}/{db}/{table}/{uuid}")
            }
            Key::Table { db, table } => write!(f, "{ROOT_PREFIX}/{db}/{table}/"),
            Key::Db { db } => write!(f, "{ROOT_PREFIX}/{db}/"),
            Key::Lock { id } => write!(f, "{ROOT_PREFIX}/{LOCKS_SEGMENT}/{id}"),
            Key::Comment { db, timestamp } => {
                write!(f, "{ROOT_PREFIX}/{COMMENTS_SEGMENT}/{db}/{timestamp}")
            }
        }
    }
}
