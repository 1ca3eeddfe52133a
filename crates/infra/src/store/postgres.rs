//! Postgres-backed entity store.
//!
//! Every entity lives in one table:
//!
//! ```sql
//! CREATE TABLE entity_records (
//!     entity_type TEXT        NOT NULL,
//!     id          UUID        NOT NULL,
//!     revision    BIGINT      NOT NULL,
//!     payload     JSONB       NOT NULL,
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (entity_type, id)
//! );
//! ```
//!
//! Query criteria are translated to `jsonb` expressions over `payload`. JSON
//! `null` is folded into SQL `NULL` (`NULLIF(payload -> field, 'null')`) so
//! comparisons follow the same null semantics as the in-memory store, and
//! ordered comparisons are guarded by `jsonb_typeof` so values of different
//! JSON kinds never compare.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `OptimisticLock` | Concurrent insert of the same id |
//! | Database (check constraint violation) | `23514` | `InvalidOperation` | Invalid data |
//! | Database (other) | Any other | `Unavailable` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Unavailable` | Network errors, connection failures |
//!
//! ## Sync Bridge
//!
//! `EntityStore` is synchronous (the engine runs on OS threads). The store
//! keeps a `tokio` runtime handle and blocks on it, so it must not be called
//! from inside an async task of that runtime.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument};

use jobflow_core::{EntityId, Revision};

use super::query::{Criterion, RecordQuery, SortDirection};
use super::r#trait::{DbOperation, EntityStore, OptimisticLockFailure, StoreError, StoredRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity_records (
    entity_type TEXT        NOT NULL,
    id          UUID        NOT NULL,
    revision    BIGINT      NOT NULL CHECK (revision > 0),
    payload     JSONB       NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (entity_type, id)
)
"#;

const INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS entity_records_payload_idx
    ON entity_records USING GIN (payload jsonb_path_ops)
"#;

#[derive(Debug, Clone)]
pub struct PostgresEntityStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresEntityStore {
    /// Create a store bound to the runtime this is called from.
    pub fn new(pool: PgPool) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            StoreError::Unavailable(
                "PostgresEntityStore requires a tokio runtime; construct it inside one or use with_runtime"
                    .to_string(),
            )
        })?;
        Ok(Self::with_runtime(pool, runtime))
    }

    pub fn with_runtime(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the `entity_records` table and its payload index if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        sqlx::query(INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(entity_type = %entity_type, id = %id), err)]
    pub async fn load_record(
        &self,
        entity_type: &str,
        id: EntityId,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, id, revision, payload
            FROM entity_records
            WHERE entity_type = $1 AND id = $2
            "#,
        )
        .bind(entity_type)
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    #[instrument(skip(self, query), fields(entity_type = %query.entity_type), err)]
    pub async fn query_records(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT entity_type, id, revision, payload FROM entity_records WHERE entity_type = ",
        );
        builder.push_bind(query.entity_type.clone());
        push_criteria(&mut builder, &query.criteria);

        builder.push(" ORDER BY ");
        for key in &query.sort {
            push_field(&mut builder, &key.field);
            builder.push(match key.direction {
                SortDirection::Ascending => " ASC",
                SortDirection::Descending => " DESC",
            });
            builder.push(if key.nulls_first { " NULLS FIRST, " } else { " NULLS LAST, " });
        }
        builder.push("id ASC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("query", e))?;

        rows.iter().map(record_from_row).collect()
    }

    pub async fn count_records(&self, query: &RecordQuery) -> Result<usize, StoreError> {
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM entity_records WHERE entity_type = ");
        builder.push_bind(query.entity_type.clone());
        push_criteria(&mut builder, &query.criteria);

        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(count.max(0) as usize)
    }

    /// Apply a batch in one transaction.
    ///
    /// Each update/delete is guarded by `revision = expected`; inserts use
    /// `ON CONFLICT DO NOTHING`. Any operation that touches zero rows is a
    /// failure, and all failures are collected before rolling back.
    #[instrument(skip(self, operations), fields(operation_count = operations.len()), err)]
    pub async fn apply_batch(&self, operations: Vec<DbOperation>) -> Result<Vec<Revision>, StoreError> {
        if operations.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut revisions = Vec::with_capacity(operations.len());
        let mut failures: Vec<OptimisticLockFailure> = Vec::new();

        for (index, op) in operations.iter().enumerate() {
            let affected = apply_one(&mut tx, op).await?;
            if affected == 1 {
                revisions.push(op.resulting_revision());
            } else {
                let actual = current_revision(&mut tx, op.entity_type(), op.id()).await?;
                failures.push(op.failure(index, actual));
            }
        }

        if !failures.is_empty() {
            debug!(failures = failures.len(), "rolling back conflicting batch");
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::OptimisticLock(failures));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(revisions)
    }
}

async fn apply_one(tx: &mut Transaction<'_, Postgres>, op: &DbOperation) -> Result<u64, StoreError> {
    let result = match op {
        DbOperation::Insert {
            entity_type,
            id,
            payload,
        } => {
            sqlx::query(
                r#"
                INSERT INTO entity_records (entity_type, id, revision, payload)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (entity_type, id) DO NOTHING
                "#,
            )
            .bind(entity_type)
            .bind(id.as_uuid())
            .bind(Revision::INITIAL.value() as i64)
            .bind(payload)
            .execute(&mut **tx)
            .await
        }
        DbOperation::Update {
            entity_type,
            id,
            expected,
            payload,
        } => {
            sqlx::query(
                r#"
                UPDATE entity_records
                SET revision = revision + 1, payload = $4, updated_at = NOW()
                WHERE entity_type = $1 AND id = $2 AND revision = $3
                "#,
            )
            .bind(entity_type)
            .bind(id.as_uuid())
            .bind(expected.value() as i64)
            .bind(payload)
            .execute(&mut **tx)
            .await
        }
        DbOperation::Delete {
            entity_type,
            id,
            expected,
        } => {
            sqlx::query(
                r#"
                DELETE FROM entity_records
                WHERE entity_type = $1 AND id = $2 AND revision = $3
                "#,
            )
            .bind(entity_type)
            .bind(id.as_uuid())
            .bind(expected.value() as i64)
            .execute(&mut **tx)
            .await
        }
    };

    match result {
        Ok(done) => Ok(done.rows_affected()),
        Err(e) if is_unique_violation(&e) => Ok(0),
        Err(e) => Err(map_sqlx_error("apply", e)),
    }
}

async fn current_revision(
    tx: &mut Transaction<'_, Postgres>,
    entity_type: &str,
    id: EntityId,
) -> Result<Option<Revision>, StoreError> {
    let revision: Option<i64> = sqlx::query_scalar(
        "SELECT revision FROM entity_records WHERE entity_type = $1 AND id = $2",
    )
    .bind(entity_type)
    .bind(id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_revision", e))?;

    Ok(revision.map(|r| Revision::new(r.max(0) as u64)))
}

fn push_field(builder: &mut QueryBuilder<'_, Postgres>, field: &str) {
    builder.push("NULLIF(payload -> ");
    builder.push_bind(field.to_string());
    builder.push(", 'null'::jsonb)");
}

fn push_criteria(builder: &mut QueryBuilder<'_, Postgres>, criteria: &[Criterion]) {
    for criterion in criteria {
        builder.push(" AND ");
        push_criterion(builder, criterion);
    }
}

fn push_criterion(builder: &mut QueryBuilder<'_, Postgres>, criterion: &Criterion) {
    match criterion {
        Criterion::Eq(f, v) => push_comparison(builder, f, "=", v),
        Criterion::Lt(f, v) => push_comparison(builder, f, "<", v),
        Criterion::Le(f, v) => push_comparison(builder, f, "<=", v),
        Criterion::Gt(f, v) => push_comparison(builder, f, ">", v),
        Criterion::Ge(f, v) => push_comparison(builder, f, ">=", v),
        Criterion::Ne(f, v) => {
            builder.push("(");
            push_field(builder, f);
            builder.push(" IS NOT NULL AND ");
            push_field(builder, f);
            builder.push(" <> ");
            builder.push_bind(v.clone());
            builder.push(")");
        }
        Criterion::IsNull(f) => {
            push_field(builder, f);
            builder.push(" IS NULL");
        }
        Criterion::NotNull(f) => {
            push_field(builder, f);
            builder.push(" IS NOT NULL");
        }
        Criterion::In(f, values) => {
            if values.is_empty() {
                builder.push("FALSE");
                return;
            }
            builder.push("(");
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                push_comparison(builder, f, "=", v);
            }
            builder.push(")");
        }
        Criterion::AnyOf(inner) => {
            if inner.is_empty() {
                builder.push("FALSE");
                return;
            }
            builder.push("(");
            for (i, c) in inner.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                push_criterion(builder, c);
            }
            builder.push(")");
        }
    }
}

fn push_comparison(builder: &mut QueryBuilder<'_, Postgres>, field: &str, op: &str, value: &JsonValue) {
    builder.push("(jsonb_typeof(");
    push_field(builder, field);
    builder.push(") = jsonb_typeof(");
    builder.push_bind(value.clone());
    builder.push(") AND ");
    push_field(builder, field);
    builder.push(" ");
    builder.push(op);
    builder.push(" ");
    builder.push_bind(value.clone());
    builder.push(")");
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(format!("failed to decode record row: {e}"));
    let id: uuid::Uuid = row.try_get("id").map_err(decode)?;
    let revision: i64 = row.try_get("revision").map_err(decode)?;
    Ok(StoredRecord {
        entity_type: row.try_get("entity_type").map_err(decode)?,
        id: EntityId::from_uuid(id),
        revision: Revision::new(revision.max(0) as u64),
        payload: row.try_get("payload").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::OptimisticLock(Vec::new()),
                Some("23514") => StoreError::InvalidOperation(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl EntityStore for PostgresEntityStore {
    fn load(&self, entity_type: &str, id: EntityId) -> Result<Option<StoredRecord>, StoreError> {
        self.runtime.block_on(self.load_record(entity_type, id))
    }

    fn query(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StoreError> {
        self.runtime.block_on(self.query_records(query))
    }

    fn count(&self, query: &RecordQuery) -> Result<usize, StoreError> {
        self.runtime.block_on(self.count_records(query))
    }

    fn apply(&self, operations: Vec<DbOperation>) -> Result<Vec<Revision>, StoreError> {
        self.runtime.block_on(self.apply_batch(operations))
    }
}
