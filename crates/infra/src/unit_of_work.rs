//! Unit of work: identity map, dirty checking and atomic flush.
//!
//! A `UnitOfWork` belongs to exactly one `CommandContext`. Entities loaded
//! through it are cached by `(entity type, id)`, so repeated lookups return the
//! same instance and callers see their own writes. Changes are collected and
//! sent to the store as one batch by `flush`:
//!
//! ```text
//! inserts (registration order) -> updates (first-load order) -> deletes
//! ```
//!
//! Updates are detected by comparing each cached entity's serialized form with
//! the snapshot taken when it was loaded (or last flushed). A rejected batch
//! leaves both the store and the cache untouched, unless every failure is
//! declared ignorable by an optimistic-lock listener, in which case the ignored
//! operations are dropped and the remainder is re-submitted.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use jobflow_core::{Entity, EntityId, EntityKey, Revision};

use crate::store::{DbOperation, EntityStore, OptimisticLockFailure, RecordQuery, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EntityState {
    /// Registered for insert, not yet stored.
    Transient,
    /// Loaded from the store.
    Persistent,
    /// Detached copy merged in; always written on flush.
    Merged,
    /// Inserted and deleted in this unit of work; never reaches the store.
    DeletedTransient,
    DeletedPersistent,
}

impl EntityState {
    fn is_deleted(self) -> bool {
        matches!(self, EntityState::DeletedTransient | EntityState::DeletedPersistent)
    }
}

struct CachedEntity {
    entity: Box<dyn Any>,
    state: EntityState,
    revision: Revision,
    snapshot: Option<JsonValue>,
    serialize: fn(&dyn Any) -> Result<JsonValue, StoreError>,
    assign_revision: fn(&mut dyn Any, Revision),
}

impl CachedEntity {
    fn new<E: Entity>(entity: E, state: EntityState, snapshot: Option<JsonValue>) -> Self {
        Self {
            revision: entity.revision(),
            entity: Box::new(entity),
            state,
            snapshot,
            serialize: serialize_entity::<E>,
            assign_revision: assign_revision::<E>,
        }
    }

    fn downcast_mut<E: Entity>(&mut self, key: EntityKey) -> Result<&mut E, StoreError> {
        self.entity
            .downcast_mut::<E>()
            .ok_or_else(|| StoreError::InvalidOperation(format!("cached {key} has a different type")))
    }
}

fn serialize_entity<E: Entity>(entity: &dyn Any) -> Result<JsonValue, StoreError> {
    let entity = entity
        .downcast_ref::<E>()
        .ok_or_else(|| StoreError::Serialization(format!("expected {}", E::ENTITY_TYPE)))?;
    Ok(serde_json::to_value(entity)?)
}

fn assign_revision<E: Entity>(entity: &mut dyn Any, revision: Revision) {
    if let Some(entity) = entity.downcast_mut::<E>() {
        entity.set_revision(revision);
    }
}

/// What to do with an optimistic-lock failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockFailureResolution {
    /// Drop the failed operation and flush the rest.
    Ignore,
    /// Fail the flush.
    Fail,
}

pub type OptimisticLockListener = Box<dyn Fn(&OptimisticLockFailure) -> LockFailureResolution>;

/// Outcome of a successful flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    pub inserted: Vec<EntityKey>,
    pub updated: Vec<EntityKey>,
    pub deleted: Vec<EntityKey>,
    /// Failures a listener declared ignorable; their operations were dropped.
    pub ignored: Vec<OptimisticLockFailure>,
}

impl FlushSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn inserted_any(&self, entity_type: &str) -> bool {
        self.inserted.iter().any(|k| k.entity_type == entity_type)
    }
}

pub struct UnitOfWork {
    store: Arc<dyn EntityStore>,
    entries: HashMap<EntityKey, CachedEntity>,
    /// First-load order of cached keys; drives update ordering.
    load_order: Vec<EntityKey>,
    inserts: Vec<EntityKey>,
    deletes: Vec<EntityKey>,
    listeners: Vec<OptimisticLockListener>,
}

impl core::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("cached", &self.entries.len())
            .field("inserts", &self.inserts.len())
            .field("deletes", &self.deletes.len())
            .finish()
    }
}

impl UnitOfWork {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            entries: HashMap::new(),
            load_order: Vec::new(),
            inserts: Vec::new(),
            deletes: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Cached instance for `id`, loading it on first access.
    ///
    /// Entities deleted in this unit of work are reported as absent.
    pub fn get_or_load<E: Entity>(&mut self, id: EntityId) -> Result<Option<&mut E>, StoreError> {
        let key = EntityKey::of::<E>(id);
        if !self.entries.contains_key(&key) {
            let Some(record) = self.store.load(E::ENTITY_TYPE, id)? else {
                return Ok(None);
            };
            let mut entity: E = serde_json::from_value(record.payload.clone())?;
            entity.set_revision(record.revision);
            self.cache_loaded(key, entity, record.payload);
        }

        match self.entries.get_mut(&key) {
            Some(cached) if !cached.state.is_deleted() => cached.downcast_mut::<E>(key).map(Some),
            _ => Ok(None),
        }
    }

    /// Owned copy of the cached instance.
    pub fn find<E: Entity>(&mut self, id: EntityId) -> Result<Option<E>, StoreError> {
        Ok(self.get_or_load::<E>(id)?.map(|e| e.clone()))
    }

    fn cache_loaded<E: Entity>(&mut self, key: EntityKey, entity: E, payload: JsonValue) {
        self.entries
            .insert(key, CachedEntity::new(entity, EntityState::Persistent, Some(payload)));
        self.load_order.push(key);
    }

    /// Schedule a new entity for insertion and cache it.
    pub fn register_insert<E: Entity>(&mut self, entity: E) -> EntityId {
        let id = entity.id();
        let key = entity.key();
        self.entries
            .insert(key, CachedEntity::new(entity, EntityState::Transient, None));
        if !self.inserts.contains(&key) {
            self.inserts.push(key);
        }
        id
    }

    /// Merge a detached copy; it is written on flush even if unchanged.
    pub fn register_update<E: Entity>(&mut self, entity: E) -> Result<(), StoreError> {
        let key = entity.key();
        match self.entries.get_mut(&key) {
            Some(cached) if cached.state.is_deleted() => Err(StoreError::InvalidOperation(format!(
                "{key} was deleted in this unit of work"
            ))),
            Some(cached) => {
                let revision = cached.revision;
                let mut entity = entity;
                entity.set_revision(revision);
                cached.entity = Box::new(entity);
                if cached.state == EntityState::Persistent {
                    cached.state = EntityState::Merged;
                }
                Ok(())
            }
            None => {
                if entity.revision().is_new() {
                    return Err(StoreError::InvalidOperation(format!(
                        "{key} was never stored; register it for insert"
                    )));
                }
                self.entries
                    .insert(key, CachedEntity::new(entity, EntityState::Merged, None));
                self.load_order.push(key);
                Ok(())
            }
        }
    }

    /// Schedule deletion. Returns `false` if the entity does not exist.
    pub fn register_delete<E: Entity>(&mut self, id: EntityId) -> Result<bool, StoreError> {
        if self.get_or_load::<E>(id)?.is_none() {
            return Ok(false);
        }
        let key = EntityKey::of::<E>(id);
        let Some(cached) = self.entries.get_mut(&key) else {
            return Ok(false);
        };
        match cached.state {
            EntityState::Transient => {
                cached.state = EntityState::DeletedTransient;
                self.inserts.retain(|k| *k != key);
            }
            EntityState::Persistent | EntityState::Merged => {
                cached.state = EntityState::DeletedPersistent;
                self.deletes.push(key);
            }
            EntityState::DeletedTransient | EntityState::DeletedPersistent => return Ok(false),
        }
        Ok(true)
    }

    /// Store query filtered through the identity map.
    ///
    /// Cached instances win over freshly read rows, entities deleted in this
    /// unit of work are pruned and new rows are cached. Entities inserted in
    /// this unit of work are not visible until flushed.
    pub fn query<E: Entity>(&mut self, query: &RecordQuery) -> Result<Vec<E>, StoreError> {
        let records = self.store.query(query)?;
        let mut result = Vec::with_capacity(records.len());

        for record in records {
            let key = EntityKey::of::<E>(record.id);
            if let Some(cached) = self.entries.get_mut(&key) {
                if !cached.state.is_deleted() {
                    result.push(cached.downcast_mut::<E>(key)?.clone());
                }
                continue;
            }
            let mut entity: E = serde_json::from_value(record.payload.clone())?;
            entity.set_revision(record.revision);
            result.push(entity.clone());
            self.cache_loaded(key, entity, record.payload);
        }

        Ok(result)
    }

    /// Store count; pending changes of this unit of work are not reflected.
    pub fn count(&self, query: &RecordQuery) -> Result<usize, StoreError> {
        self.store.count(query)
    }

    pub fn on_optimistic_lock<F>(&mut self, listener: F)
    where
        F: Fn(&OptimisticLockFailure) -> LockFailureResolution + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn has_pending_changes(&self) -> Result<bool, StoreError> {
        Ok(!self.pending_operations()?.is_empty())
    }

    fn pending_operations(&self) -> Result<Vec<(EntityKey, DbOperation)>, StoreError> {
        let mut ops = Vec::new();

        for key in &self.inserts {
            if let Some(cached) = self.entries.get(key) {
                if cached.state == EntityState::Transient {
                    ops.push((
                        *key,
                        DbOperation::Insert {
                            entity_type: key.entity_type.to_string(),
                            id: key.id,
                            payload: (cached.serialize)(cached.entity.as_ref())?,
                        },
                    ));
                }
            }
        }

        for key in &self.load_order {
            let Some(cached) = self.entries.get(key) else {
                continue;
            };
            let dirty_candidate = matches!(cached.state, EntityState::Persistent | EntityState::Merged);
            if !dirty_candidate {
                continue;
            }
            let payload = (cached.serialize)(cached.entity.as_ref())?;
            let changed = cached.state == EntityState::Merged || cached.snapshot.as_ref() != Some(&payload);
            if changed {
                ops.push((
                    *key,
                    DbOperation::Update {
                        entity_type: key.entity_type.to_string(),
                        id: key.id,
                        expected: cached.revision,
                        payload,
                    },
                ));
            }
        }

        for key in &self.deletes {
            if let Some(cached) = self.entries.get(key) {
                if cached.state == EntityState::DeletedPersistent {
                    ops.push((
                        *key,
                        DbOperation::Delete {
                            entity_type: key.entity_type.to_string(),
                            id: key.id,
                            expected: cached.revision,
                        },
                    ));
                }
            }
        }

        Ok(ops)
    }

    fn resolve(&self, failure: &OptimisticLockFailure) -> LockFailureResolution {
        if self
            .listeners
            .iter()
            .any(|l| l(failure) == LockFailureResolution::Ignore)
        {
            LockFailureResolution::Ignore
        } else {
            LockFailureResolution::Fail
        }
    }

    /// Send every pending change to the store as one atomic batch.
    pub fn flush(&mut self) -> Result<FlushSummary, StoreError> {
        let mut pending = self.pending_operations()?;
        let mut summary = FlushSummary::default();

        loop {
            if pending.is_empty() {
                self.clear_pending();
                return Ok(summary);
            }

            let batch: Vec<DbOperation> = pending.iter().map(|(_, op)| op.clone()).collect();
            match self.store.apply(batch) {
                Ok(revisions) => {
                    for ((key, op), revision) in pending.into_iter().zip(revisions) {
                        self.record_applied(key, op, revision, &mut summary);
                    }
                    self.clear_pending();
                    return Ok(summary);
                }
                Err(StoreError::OptimisticLock(failures)) => {
                    let all_ignorable = !failures.is_empty()
                        && failures
                            .iter()
                            .all(|f| self.resolve(f) == LockFailureResolution::Ignore);
                    if !all_ignorable {
                        return Err(StoreError::OptimisticLock(failures));
                    }

                    let dropped: HashSet<usize> = failures.iter().map(|f| f.index).collect();
                    let mut kept = Vec::with_capacity(pending.len());
                    for (index, (key, op)) in pending.into_iter().enumerate() {
                        if dropped.contains(&index) {
                            debug!(entity = %key, "ignoring optimistic lock failure");
                            self.evict(key);
                        } else {
                            kept.push((key, op));
                        }
                    }
                    pending = kept;
                    summary.ignored.extend(failures);
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn record_applied(
        &mut self,
        key: EntityKey,
        op: DbOperation,
        revision: Revision,
        summary: &mut FlushSummary,
    ) {
        match op {
            DbOperation::Delete { .. } => {
                self.entries.remove(&key);
                summary.deleted.push(key);
            }
            DbOperation::Insert { payload, .. } | DbOperation::Update { payload, .. } => {
                if let Some(cached) = self.entries.get_mut(&key) {
                    (cached.assign_revision)(cached.entity.as_mut(), revision);
                    cached.revision = revision;
                    cached.snapshot = Some(payload);
                    if cached.state == EntityState::Transient {
                        summary.inserted.push(key);
                        self.load_order.push(key);
                    } else {
                        summary.updated.push(key);
                    }
                    cached.state = EntityState::Persistent;
                }
            }
        }
    }

    fn evict(&mut self, key: EntityKey) {
        self.entries.remove(&key);
        self.load_order.retain(|k| *k != key);
        self.inserts.retain(|k| *k != key);
        self.deletes.retain(|k| *k != key);
    }

    fn clear_pending(&mut self) {
        self.inserts.clear();
        self.deletes.clear();
        let entries = &self.entries;
        self.load_order.retain(|k| entries.contains_key(k));
    }

    /// Drop every cached entity and pending change without touching the store.
    pub fn discard(&mut self) {
        self.entries.clear();
        self.load_order.clear();
        self.inserts.clear();
        self.deletes.clear();
        self.listeners.clear();
    }

    pub fn is_cached<E: Entity>(&self, id: EntityId) -> bool {
        self.entries.contains_key(&EntityKey::of::<E>(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Criterion, InMemoryEntityStore};
    use jobflow_jobs::Job;
    use jobflow_jobs::job::fields;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryEntityStore>, UnitOfWork) {
        let store = Arc::new(InMemoryEntityStore::new());
        let uow = UnitOfWork::new(store.clone());
        (store, uow)
    }

    fn stored_job(store: &Arc<InMemoryEntityStore>, job: Job) -> EntityId {
        let mut uow = UnitOfWork::new(store.clone());
        let id = uow.register_insert(job);
        uow.flush().unwrap();
        id
    }

    #[test]
    fn same_id_returns_same_instance() {
        let (store, mut uow) = setup();
        let id = stored_job(&store, Job::new("t", json!({})));

        uow.get_or_load::<Job>(id).unwrap().unwrap().priority = 9;
        let again = uow.get_or_load::<Job>(id).unwrap().unwrap();

        assert_eq!(again.priority, 9);
    }

    #[test]
    fn dirty_entities_are_updated_and_clean_ones_skipped() {
        let (store, mut uow) = setup();
        let changed = stored_job(&store, Job::new("a", json!({})));
        let untouched = stored_job(&store, Job::new("b", json!({})));

        uow.get_or_load::<Job>(changed).unwrap().unwrap().retries = 1;
        uow.get_or_load::<Job>(untouched).unwrap();
        let summary = uow.flush().unwrap();

        assert_eq!(summary.updated, vec![EntityKey::of::<Job>(changed)]);
        assert_eq!(store.load("job", changed).unwrap().unwrap().revision, Revision::new(2));
        assert_eq!(store.load("job", untouched).unwrap().unwrap().revision, Revision::INITIAL);
        assert_eq!(uow.get_or_load::<Job>(changed).unwrap().unwrap().revision(), Revision::new(2));
    }

    #[test]
    fn inserts_precede_updates_precede_deletes() {
        let (store, mut uow) = setup();
        let to_update = stored_job(&store, Job::new("u", json!({})));
        let to_delete = stored_job(&store, Job::new("d", json!({})));

        assert!(uow.register_delete::<Job>(to_delete).unwrap());
        uow.get_or_load::<Job>(to_update).unwrap().unwrap().priority = 3;
        let inserted = uow.register_insert(Job::new("i", json!({})));

        let ops: Vec<_> = uow.pending_operations().unwrap().into_iter().map(|(k, op)| (k.id, op.kind())).collect();
        use crate::store::OperationKind::*;
        assert_eq!(ops, vec![(inserted, Insert), (to_update, Update), (to_delete, Delete)]);
    }

    #[test]
    fn deleted_entities_read_as_absent() {
        let (store, mut uow) = setup();
        let id = stored_job(&store, Job::new("t", json!({})));
        uow.register_delete::<Job>(id).unwrap();

        assert!(uow.get_or_load::<Job>(id).unwrap().is_none());
        assert!(uow.query::<Job>(&RecordQuery::of::<Job>()).unwrap().is_empty());
    }

    #[test]
    fn insert_then_delete_never_reaches_store() {
        let (store, mut uow) = setup();
        let id = uow.register_insert(Job::new("t", json!({})));
        assert!(uow.register_delete::<Job>(id).unwrap());

        let summary = uow.flush().unwrap();
        assert!(summary.is_empty());
        assert!(store.load("job", id).unwrap().is_none());
    }

    #[test]
    fn conflicting_flush_applies_nothing() {
        let (store, mut uow) = setup();
        let id = stored_job(&store, Job::new("t", json!({})));

        uow.get_or_load::<Job>(id).unwrap().unwrap().priority = 1;
        let fresh = uow.register_insert(Job::new("new", json!({})));

        // Concurrent writer bumps the revision underneath.
        let mut other = UnitOfWork::new(store.clone());
        other.get_or_load::<Job>(id).unwrap().unwrap().priority = 2;
        other.flush().unwrap();

        let err = uow.flush().unwrap_err();
        assert!(err.is_optimistic_lock());
        assert!(store.load("job", fresh).unwrap().is_none());
        assert_eq!(store.load("job", id).unwrap().unwrap().payload[fields::PRIORITY], json!(2));
    }

    #[test]
    fn ignored_failures_are_dropped_and_rest_flushed() {
        let (store, mut uow) = setup();
        let lost = stored_job(&store, Job::new("t", json!({})));

        uow.get_or_load::<Job>(lost).unwrap().unwrap().priority = 1;
        let fresh = uow.register_insert(Job::new("new", json!({})));
        uow.on_optimistic_lock(|f| {
            if f.entity_type == "job" && f.kind == crate::store::OperationKind::Update {
                LockFailureResolution::Ignore
            } else {
                LockFailureResolution::Fail
            }
        });

        let mut other = UnitOfWork::new(store.clone());
        other.register_delete::<Job>(lost).unwrap();
        other.flush().unwrap();

        let summary = uow.flush().unwrap();
        assert_eq!(summary.ignored.len(), 1);
        assert_eq!(summary.inserted, vec![EntityKey::of::<Job>(fresh)]);
        assert!(!uow.is_cached::<Job>(lost));
    }

    #[test]
    fn query_prefers_cached_instances() {
        let (store, mut uow) = setup();
        let id = stored_job(&store, Job::new("t", json!({})));
        uow.get_or_load::<Job>(id).unwrap().unwrap().priority = 42;

        let query = RecordQuery::of::<Job>().filter(Criterion::eq(fields::JOB_TYPE, "t"));
        let jobs = uow.query::<Job>(&query).unwrap();

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, 42);
    }

    #[test]
    fn merged_copy_is_written_even_when_unchanged() {
        let (store, mut uow) = setup();
        let id = stored_job(&store, Job::new("t", json!({})));
        let detached = UnitOfWork::new(store.clone()).find::<Job>(id).unwrap().unwrap();

        uow.register_update(detached).unwrap();
        let summary = uow.flush().unwrap();

        assert_eq!(summary.updated.len(), 1);
    }

    #[test]
    fn never_stored_entity_cannot_be_merged() {
        let (_, mut uow) = setup();
        assert!(uow.register_update(Job::new("t", json!({}))).is_err());
    }
}
