//! SQLite implementation of the storage ports
//!
//! `SqliteSyncRepository` implements both `IEntityStore` and
//! `IOperationStore` over one pool.
//!
//! ## Type Mapping
//!
//! | Domain Type                        | SQL Type | Strategy                                 |
//! |------------------------------------|----------|------------------------------------------|
//! | UserId, EntityId, OperationId      | INTEGER  | `.get()` / `::new()`                     |
//! | Timestamp                          | INTEGER  | microseconds via `as_micros()`           |
//! | version, logical counter (u64)     | INTEGER  | checked `i64` conversion                 |
//! | SequenceId, DeviceId               | TEXT     | `.as_str()` / validated `::new()`        |
//! | OperationType, SyncStatus          | TEXT     | `as_str()` / `FromStr`                   |
//! | ConflictStatus                     | TEXT     | `as_str()` / `FromStr`                   |
//! | entity fields, old/new values      | TEXT     | serde_json                               |
//! | client timestamp (DateTime<Utc>)   | TEXT     | RFC 3339                                 |
//! | ConflictRecord                     | TEXT     | serde_json of the whole record           |
//!
//! Entity writes only happen through [`IOperationStore::commit`], which
//! claims the operation, re-reads the entity, writes the new row and the
//! conflict record inside one transaction. Claiming first takes SQLite's
//! write lock, so nothing else can change the entity before the commit ends.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use tasksync_core::domain::{
    ConflictRecord, ConflictStatus, DeviceId, EntityId, EntitySnapshot, Operation,
    OperationDraft, OperationId, OperationType, SequenceId, SyncStatus, Timestamp, UserId,
};
use tasksync_core::ports::{
    CommitOutcome, IEntityStore, IOperationStore, InsertOutcome, OperationCommit,
};

use crate::CacheError;

/// SQLite-based implementation of the entity and operation store ports
pub struct SqliteSyncRepository {
    pool: SqlitePool,
}

impl SqliteSyncRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Queries shared by the pool and by commit transactions
// ============================================================================

async fn load_entity<'e, E>(executor: E, id: EntityId) -> Result<Option<EntitySnapshot>, CacheError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
        .bind(id.get())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(snapshot_from_row).transpose()
}

async fn insert_entity<'e, E>(executor: E, snapshot: &EntitySnapshot) -> Result<(), CacheError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO entities \
         (id, owner_id, version, updated_at, deleted, conflict_status, fields) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(snapshot.id.get())
    .bind(snapshot.owner_id.get())
    .bind(to_i64(snapshot.version, "version")?)
    .bind(snapshot.updated_at.as_micros())
    .bind(snapshot.deleted)
    .bind(snapshot.conflict_status.as_str())
    .bind(fields_to_json(&snapshot.fields)?)
    .execute(executor)
    .await?;
    Ok(())
}

async fn update_entity<'e, E>(executor: E, snapshot: &EntitySnapshot) -> Result<(), CacheError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE entities \
         SET version = ?, updated_at = ?, deleted = ?, conflict_status = ?, fields = ? \
         WHERE id = ?",
    )
    .bind(to_i64(snapshot.version, "version")?)
    .bind(snapshot.updated_at.as_micros())
    .bind(snapshot.deleted)
    .bind(snapshot.conflict_status.as_str())
    .bind(fields_to_json(&snapshot.fields)?)
    .bind(snapshot.id.get())
    .execute(executor)
    .await?;
    Ok(())
}

async fn save_conflict<'e, E>(executor: E, record: &ConflictRecord) -> Result<(), CacheError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let json = serde_json::to_string(record)
        .map_err(|e| CacheError::SerializationError(format!("Failed to serialize conflict: {}", e)))?;

    sqlx::query(
        "INSERT OR REPLACE INTO conflicts \
         (operation_id, user_id, entity_id, server_timestamp, record) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(record.operation_id().get())
    .bind(record.user_id().get())
    .bind(record.entity_id().get())
    .bind(record.server_timestamp().as_micros())
    .bind(&json)
    .execute(executor)
    .await?;
    Ok(())
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn to_i64(value: u64, what: &str) -> Result<i64, CacheError> {
    i64::try_from(value)
        .map_err(|_| CacheError::SerializationError(format!("{} {} out of range", what, value)))
}

fn to_u64(value: i64, what: &str) -> Result<u64, CacheError> {
    u64::try_from(value)
        .map_err(|_| CacheError::SerializationError(format!("Negative {}: {}", what, value)))
}

fn fields_to_json(fields: &BTreeMap<String, Value>) -> Result<String, CacheError> {
    serde_json::to_string(fields)
        .map_err(|e| CacheError::SerializationError(format!("Failed to serialize fields: {}", e)))
}

fn value_to_json(value: &Option<Value>) -> Result<Option<String>, CacheError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| CacheError::SerializationError(format!("Failed to serialize value: {}", e)))
}

fn value_from_json(column: &str, raw: Option<String>) -> Result<Option<Value>, CacheError> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| CacheError::SerializationError(format!("Invalid {} JSON: {}", column, e)))
}

fn parse_datetime(raw: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match raw {
        Some(ref s) if !s.is_empty() => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| {
                CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
            }),
        _ => Ok(None),
    }
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn snapshot_from_row(row: &SqliteRow) -> Result<EntitySnapshot, CacheError> {
    let fields_str: String = row.try_get("fields")?;
    let fields: BTreeMap<String, Value> = serde_json::from_str(&fields_str)
        .map_err(|e| CacheError::SerializationError(format!("Invalid fields JSON: {}", e)))?;
    let status_str: String = row.try_get("conflict_status")?;
    let conflict_status = ConflictStatus::from_str(&status_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    Ok(EntitySnapshot {
        id: EntityId::new(row.try_get("id")?),
        owner_id: UserId::new(row.try_get("owner_id")?),
        version: to_u64(row.try_get("version")?, "version")?,
        updated_at: Timestamp::from_micros(row.try_get("updated_at")?),
        deleted: row.try_get("deleted")?,
        conflict_status,
        fields,
    })
}

fn operation_from_row(row: &SqliteRow) -> Result<Operation, CacheError> {
    let sequence_str: String = row.try_get("sequence_id")?;
    let device_str: String = row.try_get("device_id")?;
    let type_str: String = row.try_get("operation_type")?;
    let status_str: String = row.try_get("sync_status")?;

    let invalid = |e: tasksync_core::domain::DomainError| {
        CacheError::SerializationError(e.to_string())
    };

    Ok(Operation {
        id: OperationId::new(row.try_get("id")?),
        sequence_id: SequenceId::new(sequence_str).map_err(invalid)?,
        user_id: UserId::new(row.try_get("user_id")?),
        entity_id: EntityId::new(row.try_get("entity_id")?),
        operation_type: OperationType::from_str(&type_str).map_err(invalid)?,
        field_name: row.try_get("field_name")?,
        old_value: value_from_json("old_value", row.try_get("old_value")?)?,
        new_value: value_from_json("new_value", row.try_get("new_value")?)?,
        client_timestamp: parse_datetime(row.try_get("client_timestamp")?)?,
        server_timestamp: Timestamp::from_micros(row.try_get("server_timestamp")?),
        logical_counter: to_u64(row.try_get("logical_counter")?, "logical counter")?,
        device_id: DeviceId::new(device_str).map_err(invalid)?,
        sync_status: SyncStatus::from_str(&status_str).map_err(invalid)?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<ConflictRecord, CacheError> {
    let record: String = row.try_get("record")?;
    serde_json::from_str(&record)
        .map_err(|e| CacheError::SerializationError(format!("Invalid conflict JSON: {}", e)))
}

// ============================================================================
// IEntityStore
// ============================================================================

#[async_trait::async_trait]
impl IEntityStore for SqliteSyncRepository {
    async fn get_entity(&self, id: EntityId) -> anyhow::Result<Option<EntitySnapshot>> {
        Ok(load_entity(&self.pool, id).await?)
    }

    async fn list_changed_since(
        &self,
        owner: UserId,
        since: Option<Timestamp>,
        limit: usize,
    ) -> anyhow::Result<Vec<EntitySnapshot>> {
        let since = since.map_or(i64::MIN, |ts| ts.as_micros());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT * FROM entities WHERE owner_id = ? AND updated_at > ? \
             ORDER BY updated_at ASC, id ASC LIMIT ?",
        )
        .bind(owner.get())
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            entities.push(snapshot_from_row(row)?);
        }
        Ok(entities)
    }
}

// ============================================================================
// IOperationStore
// ============================================================================

#[async_trait::async_trait]
impl IOperationStore for SqliteSyncRepository {
    async fn insert_if_absent(&self, draft: &OperationDraft) -> anyhow::Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO operations \
             (sequence_id, user_id, entity_id, operation_type, field_name, old_value, \
              new_value, client_timestamp, server_timestamp, logical_counter, device_id, \
              sync_status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(sequence_id) DO NOTHING",
        )
        .bind(draft.sequence_id.as_str())
        .bind(draft.user_id.get())
        .bind(draft.entity_id.get())
        .bind(draft.operation_type.as_str())
        .bind(draft.field_name.as_deref())
        .bind(value_to_json(&draft.old_value)?)
        .bind(value_to_json(&draft.new_value)?)
        .bind(draft.client_timestamp.map(|dt| dt.to_rfc3339()))
        .bind(draft.server_timestamp.as_micros())
        .bind(to_i64(draft.logical_counter, "logical counter")?)
        .bind(draft.device_id.as_str())
        .bind(SyncStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            let op = draft
                .clone()
                .into_operation(OperationId::new(result.last_insert_rowid()));
            tracing::trace!(operation_id = %op.id, sequence_id = %op.sequence_id, "Saved operation");
            return Ok(InsertOutcome::Inserted(op));
        }

        let row = sqlx::query("SELECT * FROM operations WHERE sequence_id = ?")
            .bind(draft.sequence_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(InsertOutcome::Existing(operation_from_row(&row)?))
    }

    async fn get_operation(&self, id: OperationId) -> anyhow::Result<Option<Operation>> {
        let row = sqlx::query("SELECT * FROM operations WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(operation_from_row).transpose()?)
    }

    async fn commit(&self, commit: &OperationCommit) -> anyhow::Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE operations SET sync_status = ? WHERE id = ? AND sync_status = ?",
        )
        .bind(commit.status.as_str())
        .bind(commit.operation_id.get())
        .bind(commit.expected_status.as_str())
        .execute(&mut *tx)
        .await?;

        let stored_status = if claimed.rows_affected() == 1 {
            commit.expected_status
        } else {
            let status: Option<String> =
                sqlx::query_scalar("SELECT sync_status FROM operations WHERE id = ?")
                    .bind(commit.operation_id.get())
                    .fetch_optional(&mut *tx)
                    .await?;
            let status = status.ok_or(CacheError::UnknownOperation(commit.operation_id.get()))?;
            SyncStatus::from_str(&status)
                .map_err(|e| CacheError::SerializationError(e.to_string()))?
        };

        let current = load_entity(&mut *tx, commit.entity_id()).await?;
        let row = match commit.evaluate(stored_status, current.as_ref()) {
            Ok(row) => row,
            Err(outcome) => {
                tx.rollback().await?;
                tracing::trace!(
                    operation_id = %commit.operation_id,
                    outcome = ?outcome,
                    "Commit refused"
                );
                return Ok(outcome);
            }
        };

        if let Some(row) = &row {
            match current {
                None => insert_entity(&mut *tx, row).await?,
                Some(_) => update_entity(&mut *tx, row).await?,
            }
        }
        if let Some(record) = &commit.conflict {
            save_conflict(&mut *tx, record).await?;
        }
        tx.commit().await?;

        tracing::trace!(
            operation_id = %commit.operation_id,
            entity_id = %commit.entity_id(),
            status = %commit.status,
            "Committed operation"
        );
        Ok(commit.committed(row))
    }

    async fn pending_operations(&self, user: UserId) -> anyhow::Result<Vec<Operation>> {
        let rows = sqlx::query(
            "SELECT * FROM operations WHERE user_id = ? AND sync_status = 'pending' \
             ORDER BY server_timestamp ASC, id ASC",
        )
        .bind(user.get())
        .fetch_all(&self.pool)
        .await?;

        let mut operations = Vec::with_capacity(rows.len());
        for row in &rows {
            operations.push(operation_from_row(row)?);
        }
        Ok(operations)
    }

    async fn get_conflict(
        &self,
        operation_id: OperationId,
    ) -> anyhow::Result<Option<ConflictRecord>> {
        let row = sqlx::query("SELECT record FROM conflicts WHERE operation_id = ?")
            .bind(operation_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conflict_from_row).transpose()?)
    }

    async fn unresolved_conflicts(&self, user: UserId) -> anyhow::Result<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT c.record FROM conflicts c \
             JOIN operations o ON o.id = c.operation_id \
             WHERE c.user_id = ? AND o.sync_status = 'conflicted' \
             ORDER BY c.server_timestamp ASC",
        )
        .bind(user.get())
        .fetch_all(&self.pool)
        .await?;

        let mut conflicts = Vec::with_capacity(rows.len());
        for row in &rows {
            conflicts.push(conflict_from_row(row)?);
        }
        Ok(conflicts)
    }
}
