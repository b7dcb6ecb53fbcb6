use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::cache::{Entity, Result};

use super::SchemaTable;

/// Process-wide cache of resolved schemas, one per entity type.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<TypeId, Arc<SchemaTable>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the schema of `T`, resolving and validating it on first use.
    pub fn resolve<T: Entity>(&self) -> Result<Arc<SchemaTable>> {
        let type_id = TypeId::of::<T>();
        if let Some(table) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
        {
            return Ok(Arc::clone(table));
        }

        let table = T::schema();
        table.validate()?;

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let table = tables.entry(type_id).or_insert_with(|| Arc::new(table));
        Ok(Arc::clone(table))
    }

    /// Number of resolved schemas.
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
