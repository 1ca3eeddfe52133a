//! Entity store gateway.
//!
//! The store is the single source of truth for every durable record and the
//! sole arbiter of revision conflicts. Entities travel through it as JSON
//! payloads keyed by `(entity type, id)`, with the revision kept beside the
//! payload.
//!
//! - `r#trait`: the `EntityStore` contract and the batch operations it applies
//! - `query`: criteria, sort keys and limits for `query`/`count`
//! - `in_memory`: lock-protected map (tests/dev)
//! - `postgres`: one `entity_records` table with a `jsonb` payload

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEntityStore;
pub use postgres::PostgresEntityStore;
pub use query::{Criterion, RecordQuery, SortDirection, SortKey};
pub use r#trait::{
    DbOperation, EntityStore, OperationKind, OptimisticLockFailure, StoreError, StoredRecord,
};
