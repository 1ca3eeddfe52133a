use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value as JsonValue;

use jobflow_core::{EntityId, Revision};

use super::query::RecordQuery;
use super::r#trait::{DbOperation, EntityStore, StoreError, StoredRecord};

#[derive(Debug, Clone)]
struct Row {
    revision: Revision,
    payload: JsonValue,
}

type Table = HashMap<EntityId, Row>;

/// In-memory entity store.
///
/// Intended for tests/dev. One write lock covers a whole batch, which makes
/// `apply` atomic with respect to every other reader and writer.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("lock poisoned".to_string())
    }

    fn matching(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let Some(table) = tables.get(&query.entity_type) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<(EntityId, &Row)> = table
            .iter()
            .filter(|(_, row)| query.matches(&row.payload))
            .map(|(id, row)| (*id, row))
            .collect();
        rows.sort_by(|(a_id, a), (b_id, b)| query.order((*a_id, &a.payload), (*b_id, &b.payload)));

        Ok(rows
            .into_iter()
            .map(|(id, row)| StoredRecord {
                entity_type: query.entity_type.clone(),
                id,
                revision: row.revision,
                payload: row.payload.clone(),
            })
            .collect())
    }
}

impl EntityStore for InMemoryEntityStore {
    fn load(&self, entity_type: &str, id: EntityId) -> Result<Option<StoredRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables
            .get(entity_type)
            .and_then(|t| t.get(&id))
            .map(|row| StoredRecord {
                entity_type: entity_type.to_string(),
                id,
                revision: row.revision,
                payload: row.payload.clone(),
            }))
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let mut records = self.matching(query)?;
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn count(&self, query: &RecordQuery) -> Result<usize, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables
            .get(&query.entity_type)
            .map(|t| t.values().filter(|row| query.matches(&row.payload)).count())
            .unwrap_or(0))
    }

    fn apply(&self, operations: Vec<DbOperation>) -> Result<Vec<Revision>, StoreError> {
        if operations.is_empty() {
            return Ok(vec![]);
        }

        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;

        // Validate the whole batch first, tracking revisions the batch itself
        // would leave behind so operations on the same row chain correctly.
        let mut staged: HashMap<(&str, EntityId), Option<Revision>> = HashMap::new();
        let mut failures = Vec::new();
        for (index, op) in operations.iter().enumerate() {
            let key = (op.entity_type(), op.id());
            let current = match staged.get(&key) {
                Some(rev) => *rev,
                None => tables
                    .get(op.entity_type())
                    .and_then(|t| t.get(&op.id()))
                    .map(|row| row.revision),
            };

            if op.expected_revision().matches(current) {
                let after = match op {
                    DbOperation::Delete { .. } => None,
                    _ => Some(op.resulting_revision()),
                };
                staged.insert(key, after);
            } else {
                failures.push(op.failure(index, current));
            }
        }

        if !failures.is_empty() {
            return Err(StoreError::OptimisticLock(failures));
        }
        drop(staged);

        let mut revisions = Vec::with_capacity(operations.len());
        for op in operations {
            let revision = op.resulting_revision();
            match op {
                DbOperation::Insert {
                    entity_type,
                    id,
                    payload,
                }
                | DbOperation::Update {
                    entity_type,
                    id,
                    payload,
                    ..
                } => {
                    tables
                        .entry(entity_type)
                        .or_default()
                        .insert(id, Row { revision, payload });
                }
                DbOperation::Delete { entity_type, id, .. } => {
                    if let Some(table) = tables.get_mut(&entity_type) {
                        table.remove(&id);
                    }
                }
            }
            revisions.push(revision);
        }

        Ok(revisions)
    }
}
