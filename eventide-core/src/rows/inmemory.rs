//! In-memory row store.
//!
//! Rows are kept per entity type in a map guarded by a single lock. A
//! commit checks every change before applying any, so a failed commit leaves
//! the store untouched.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::{RowChange, RowError};
use crate::schema::{Document, EntityDescriptor, PrimaryKey};

type Tables = HashMap<&'static str, HashMap<PrimaryKey, Document>>;

/// Thread-safe in-memory [`RowStore`](super::RowStore).
#[derive(Clone, Default)]
pub struct RowStore {
    tables: Arc<RwLock<Tables>>,
}

impl RowStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows across all entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .expect("row store lock poisoned")
            .values()
            .map(HashMap::len)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl super::RowStore for RowStore {
    type Session = Session;

    async fn begin(&self) -> Result<Self::Session, RowError> {
        Ok(Session {
            tables: Arc::clone(&self.tables),
        })
    }
}

/// Session over a [`RowStore`]. Reads observe committed rows only.
pub struct Session {
    tables: Arc<RwLock<Tables>>,
}

impl super::RowSession for Session {
    async fn find<'a>(
        &'a mut self,
        descriptor: &'a EntityDescriptor,
        key: &'a PrimaryKey,
    ) -> Result<Option<Document>, RowError> {
        Ok(self
            .tables
            .read()
            .expect("row store lock poisoned")
            .get(descriptor.entity_type())
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    async fn commit(self, changes: Vec<RowChange>) -> Result<(), RowError> {
        let mut tables = self.tables.write().expect("row store lock poisoned");
        for change in &changes {
            let entity_type = change.descriptor().entity_type();
            let exists = tables
                .get(entity_type)
                .is_some_and(|rows| rows.contains_key(change.key()));
            match change {
                RowChange::Added { key, .. } if exists => {
                    return Err(RowError::Duplicate {
                        entity_type,
                        key: key.clone(),
                    });
                }
                RowChange::Modified { key, .. } | RowChange::Deleted { key, .. } if !exists => {
                    return Err(RowError::Missing {
                        entity_type,
                        key: key.clone(),
                    });
                }
                _ => {}
            }
        }
        for change in changes {
            let entity_type = change.descriptor().entity_type();
            let rows = tables.entry(entity_type).or_default();
            match change {
                RowChange::Added { key, document, .. }
                | RowChange::Modified { key, document, .. } => {
                    rows.insert(key, document);
                }
                RowChange::Deleted { key, .. } => {
                    rows.remove(&key);
                }
            }
        }
        drop(tables);
        Ok(())
    }
}
