pub mod schema;
pub mod types;

use crate::error::OvsdbError;
use parking_lot::RwLock;
use schema::DatabaseSchema;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of parsed database schemas, keyed by database name.
/// Populated at startup and effectively immutable afterwards.
#[derive(Debug, Default)]
pub struct Schemas {
    inner: RwLock<BTreeMap<String, Arc<DatabaseSchema>>>,
}

impl Schemas {
    pub fn add_from_text(&self, text: &str) -> Result<Arc<DatabaseSchema>, OvsdbError> {
        let schema = Arc::new(DatabaseSchema::parse(text)?);
        self.inner
            .write()
            .insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, db_name: &str) -> Result<Arc<DatabaseSchema>, OvsdbError> {
        self.inner
            .read()
            .get(db_name)
            .cloned()
            .ok_or_else(|| OvsdbError::Ovsdb(format!("unknown database {db_name}")))
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}
