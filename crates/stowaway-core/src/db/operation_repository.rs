//! Offline operation repository implementation

use crate::error::{Error, Result};
use crate::models::{
    ConflictStrategy, OfflineOperation, OperationId, OperationPayload, Priority,
};
use libsql::Connection;
use serde_json::Value;

use super::values::{
    nullable_integer, nullable_text, optional_integer, optional_text, to_sql_integer,
};

const SELECT_COLUMNS: &str = "SELECT id, operation_type, resource_type, resource_id, data, priority,
        retry_count, max_retries, created_at, scheduled_at, last_attempt_at, error_message,
        conflict_resolution, needs_decision, conflict_snapshot
     FROM offline_operations";

/// Trait for queued operation storage (async)
#[allow(async_fn_in_trait)]
pub trait OperationRepository {
    /// Persist a new operation
    async fn insert(&self, operation: &OfflineOperation) -> Result<()>;

    /// Get an operation by ID
    async fn get(&self, id: &OperationId) -> Result<Option<OfflineOperation>>;

    /// Operations eligible at `now`, highest priority first, then oldest
    async fn list_pending(
        &self,
        now: i64,
        min_priority: Priority,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>>;

    /// Operations whose retries are exhausted, newest first
    async fn list_failed(&self) -> Result<Vec<OfflineOperation>>;

    /// Operations parked for a user decision, oldest first
    async fn list_awaiting_decision(&self) -> Result<Vec<OfflineOperation>>;

    /// Every stored operation
    async fn list_all(&self) -> Result<Vec<OfflineOperation>>;

    /// Store retry bookkeeping for an attempt
    async fn update_retry(
        &self,
        id: &OperationId,
        retry_count: u32,
        scheduled_at: i64,
        attempted_at: i64,
        error: &str,
    ) -> Result<()>;

    /// Exhaust retries immediately
    async fn mark_failed(&self, id: &OperationId, error: &str, attempted_at: i64) -> Result<()>;

    /// Park an operation with the server version it conflicted with
    async fn park(&self, id: &OperationId, snapshot: &Value, attempted_at: i64) -> Result<()>;

    /// Return a parked operation to the pending set
    async fn release(
        &self,
        id: &OperationId,
        payload: &OperationPayload,
        strategy: Option<ConflictStrategy>,
        now: i64,
    ) -> Result<()>;

    /// Move every failed operation back to pending, returning how many moved
    async fn reset_failed(&self, now: i64) -> Result<usize>;

    /// Delete an operation, returning whether it existed
    async fn delete(&self, id: &OperationId) -> Result<bool>;

    /// Delete every operation, returning how many were removed
    async fn clear(&self) -> Result<usize>;
}

/// libSQL implementation of `OperationRepository`
pub struct LibSqlOperationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_operations(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<OfflineOperation>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut operations = Vec::new();
        while let Some(row) = rows.next().await? {
            operations.push(Self::parse_operation(&row)?);
        }
        Ok(operations)
    }

    /// Like `query_operations`, but rows that no longer decode are moved to
    /// the failed set instead of failing the whole listing.
    async fn query_decodable(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<OfflineOperation>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut operations = Vec::new();
        let mut undecodable = Vec::new();
        while let Some(row) = rows.next().await? {
            match Self::parse_operation(&row) {
                Ok(operation) => operations.push(operation),
                Err(error) => {
                    let id: String = row.get(0)?;
                    tracing::warn!("Skipping unreadable operation {id}: {error}");
                    undecodable.push((id, error.to_string()));
                }
            }
        }
        drop(rows);

        for (id, error) in undecodable {
            self.conn
                .execute(
                    "UPDATE offline_operations
                     SET retry_count = MAX(retry_count, max_retries), needs_decision = 0,
                         conflict_snapshot = NULL, error_message = ?
                     WHERE id = ?",
                    libsql::params![format!("Unreadable operation: {error}"), id],
                )
                .await?;
        }
        Ok(operations)
    }

    /// Parse an operation from a database row
    fn parse_operation(row: &libsql::Row) -> Result<OfflineOperation> {
        let id: String = row.get(0)?;
        let kind: String = row.get(1)?;
        let resource_type: String = row.get(2)?;
        let data: String = row.get(4)?;
        let retry_count: i64 = row.get(6)?;
        let max_retries: i64 = row.get(7)?;
        let conflict_strategy = optional_text(row, 12)?
            .map(|value| value.parse::<ConflictStrategy>())
            .transpose()?;
        let conflict_snapshot = optional_text(row, 14)?
            .map(|value| serde_json::from_str::<Value>(&value))
            .transpose()?;

        Ok(OfflineOperation {
            id: id
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid operation ID: {id}")))?,
            kind: kind.parse()?,
            resource_type: resource_type.parse()?,
            resource_id: optional_text(row, 3)?,
            payload: OperationPayload::decode(&data)?,
            priority: Priority::from_rank(row.get(5)?),
            retry_count: u32::try_from(retry_count).unwrap_or(0),
            max_retries: u32::try_from(max_retries).unwrap_or(0),
            created_at: row.get(8)?,
            scheduled_at: row.get(9)?,
            last_attempt_at: optional_integer(row, 10)?,
            last_error: optional_text(row, 11)?,
            conflict_strategy,
            needs_decision: row.get::<i64>(13)? != 0,
            conflict_snapshot,
        })
    }

    fn ensure_updated(rows: u64, id: &OperationId) -> Result<()> {
        if rows == 0 {
            return Err(Error::NotFound(format!("Operation {id}")));
        }
        Ok(())
    }
}

impl OperationRepository for LibSqlOperationRepository<'_> {
    async fn insert(&self, operation: &OfflineOperation) -> Result<()> {
        let snapshot = operation
            .conflict_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                "INSERT INTO offline_operations (
                    id, operation_type, resource_type, resource_id, data, priority,
                    retry_count, max_retries, created_at, scheduled_at, last_attempt_at,
                    error_message, conflict_resolution, needs_decision, conflict_snapshot
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    operation.id.as_str(),
                    operation.kind.as_str(),
                    operation.resource_type.as_str(),
                    nullable_text(operation.resource_id.clone()),
                    operation.payload.encode()?,
                    operation.priority.rank(),
                    i64::from(operation.retry_count),
                    i64::from(operation.max_retries),
                    operation.created_at,
                    operation.scheduled_at,
                    nullable_integer(operation.last_attempt_at),
                    nullable_text(operation.last_error.clone()),
                    nullable_text(operation.conflict_strategy.map(|s| s.as_str().to_string())),
                    i64::from(operation.needs_decision),
                    nullable_text(snapshot),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &OperationId) -> Result<Option<OfflineOperation>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
        let mut operations = self.query_operations(&sql, [id.as_str()]).await?;
        Ok(operations.pop())
    }

    async fn list_pending(
        &self,
        now: i64,
        min_priority: Priority,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE retry_count < max_retries
               AND scheduled_at <= ?
               AND needs_decision = 0
               AND priority >= ?
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?"
        );
        self.query_decodable(
            &sql,
            libsql::params![now, min_priority.rank(), to_sql_integer(limit)],
        )
        .await
    }

    async fn list_failed(&self) -> Result<Vec<OfflineOperation>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE retry_count >= max_retries AND needs_decision = 0
             ORDER BY created_at DESC, rowid DESC"
        );
        self.query_decodable(&sql, ()).await
    }

    async fn list_awaiting_decision(&self) -> Result<Vec<OfflineOperation>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE needs_decision = 1
             ORDER BY created_at ASC, rowid ASC"
        );
        self.query_decodable(&sql, ()).await
    }

    async fn list_all(&self) -> Result<Vec<OfflineOperation>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at ASC, rowid ASC");
        self.query_decodable(&sql, ()).await
    }

    async fn update_retry(
        &self,
        id: &OperationId,
        retry_count: u32,
        scheduled_at: i64,
        attempted_at: i64,
        error: &str,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE offline_operations
                 SET retry_count = ?, scheduled_at = MAX(scheduled_at, ?),
                     last_attempt_at = ?, error_message = ?
                 WHERE id = ?",
                libsql::params![
                    i64::from(retry_count),
                    scheduled_at,
                    attempted_at,
                    error,
                    id.as_str()
                ],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }

    async fn mark_failed(&self, id: &OperationId, error: &str, attempted_at: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE offline_operations
                 SET retry_count = MAX(retry_count, max_retries),
                     last_attempt_at = ?, error_message = ?
                 WHERE id = ?",
                libsql::params![attempted_at, error, id.as_str()],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }

    async fn park(&self, id: &OperationId, snapshot: &Value, attempted_at: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE offline_operations
                 SET needs_decision = 1, conflict_snapshot = ?, last_attempt_at = ?,
                     error_message = NULL
                 WHERE id = ?",
                libsql::params![serde_json::to_string(snapshot)?, attempted_at, id.as_str()],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }

    async fn release(
        &self,
        id: &OperationId,
        payload: &OperationPayload,
        strategy: Option<ConflictStrategy>,
        now: i64,
    ) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE offline_operations
                 SET needs_decision = 0, conflict_snapshot = NULL, data = ?,
                     conflict_resolution = ?, scheduled_at = MAX(scheduled_at, ?)
                 WHERE id = ? AND needs_decision = 1",
                libsql::params![
                    payload.encode()?,
                    nullable_text(strategy.map(|s| s.as_str().to_string())),
                    now,
                    id.as_str()
                ],
            )
            .await?;
        Self::ensure_updated(rows, id)
    }

    async fn reset_failed(&self, now: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute(
                "UPDATE offline_operations
                 SET retry_count = 0, scheduled_at = MAX(scheduled_at, ?), error_message = NULL
                 WHERE retry_count >= max_retries AND needs_decision = 0",
                [now],
            )
            .await?;
        Ok(usize::try_from(rows).unwrap_or(usize::MAX))
    }

    async fn delete(&self, id: &OperationId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM offline_operations WHERE id = ?", [id.as_str()])
            .await?;
        Ok(rows > 0)
    }

    async fn clear(&self) -> Result<usize> {
        let rows = self.conn.execute("DELETE FROM offline_operations", ()).await?;
        Ok(usize::try_from(rows).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{NewOperation, OperationKind, ResourceType, DEFAULT_MAX_RETRIES};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn operation(priority: Priority, created_at: i64) -> OfflineOperation {
        NewOperation::new(
            OperationKind::Update,
            ResourceType::Post,
            json!({"id": "p1", "title": "draft"}),
        )
        .with_resource_id("p1")
        .with_priority(priority)
        .into_operation(DEFAULT_MAX_RETRIES, created_at)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_and_get() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let op = operation(Priority::High, 1_000);
        repo.insert(&op).await.unwrap();

        let fetched = repo.get(&op.id).await.unwrap().unwrap();
        assert_eq!(fetched, op);
        assert!(repo.get(&OperationId::new()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_orders_by_priority_then_age() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let low = operation(Priority::Low, 1_000);
        let critical = operation(Priority::Critical, 3_000);
        let high_old = operation(Priority::High, 1_500);
        let high_new = operation(Priority::High, 2_000);
        for op in [&low, &critical, &high_new, &high_old] {
            repo.insert(op).await.unwrap();
        }

        let pending = repo.list_pending(5_000, Priority::Low, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![critical.id, high_old.id, high_new.id, low.id]);

        let urgent = repo.list_pending(5_000, Priority::High, 10).await.unwrap();
        assert_eq!(urgent.len(), 3);

        let limited = repo.list_pending(5_000, Priority::Low, 1).await.unwrap();
        assert_eq!(limited[0].id, critical.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_excludes_future_and_parked() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let future = operation(Priority::Medium, 10_000);
        let parked = operation(Priority::Medium, 1_000);
        repo.insert(&future).await.unwrap();
        repo.insert(&parked).await.unwrap();
        repo.park(&parked.id, &json!({"title": "server"}), 2_000)
            .await
            .unwrap();

        assert!(repo
            .list_pending(5_000, Priority::Low, 10)
            .await
            .unwrap()
            .is_empty());
        let awaiting = repo.list_awaiting_decision().await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(
            awaiting[0].conflict_snapshot,
            Some(json!({"title": "server"}))
        );
        assert!(repo.list_failed().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_never_moves_schedule_backwards() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let op = operation(Priority::Medium, 1_000);
        repo.insert(&op).await.unwrap();
        repo.update_retry(&op.id, 1, 9_000, 2_000, "timeout")
            .await
            .unwrap();
        repo.update_retry(&op.id, 2, 4_000, 3_000, "timeout")
            .await
            .unwrap();

        let fetched = repo.get(&op.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 2);
        assert_eq!(fetched.scheduled_at, 9_000);
        assert_eq!(fetched.last_attempt_at, Some(3_000));
        assert_eq!(fetched.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_failed_and_reset() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let op = operation(Priority::Medium, 1_000);
        repo.insert(&op).await.unwrap();
        repo.mark_failed(&op.id, "forbidden", 2_000).await.unwrap();

        let failed = repo.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, failed[0].max_retries);

        assert_eq!(repo.reset_failed(3_000).await.unwrap(), 1);
        let fetched = repo.get(&op.id).await.unwrap().unwrap();
        assert_eq!(fetched.retry_count, 0);
        assert_eq!(fetched.last_error, None);
        assert!(fetched.is_pending_at(3_000));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_release_replaces_payload() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let op = operation(Priority::Medium, 1_000);
        repo.insert(&op).await.unwrap();
        repo.park(&op.id, &json!({}), 2_000).await.unwrap();

        let payload = OperationPayload::new(json!({"id": "p1", "title": "chosen"}));
        repo.release(&op.id, &payload, Some(ConflictStrategy::ClientWins), 3_000)
            .await
            .unwrap();

        let fetched = repo.get(&op.id).await.unwrap().unwrap();
        assert!(!fetched.needs_decision);
        assert_eq!(fetched.conflict_snapshot, None);
        assert_eq!(fetched.payload, payload);
        assert_eq!(fetched.conflict_strategy, Some(ConflictStrategy::ClientWins));
        assert_eq!(fetched.scheduled_at, 3_000);

        // Not parked anymore
        assert!(repo
            .release(&op.id, &payload, None, 4_000)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_and_clear() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let first = operation(Priority::Low, 1_000);
        let second = operation(Priority::Low, 2_000);
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();

        assert!(repo.delete(&first.id).await.unwrap());
        assert!(!repo.delete(&first.id).await.unwrap());
        assert_eq!(repo.clear().await.unwrap(), 1);
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_payload_version_is_rejected() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let op = operation(Priority::Low, 1_000);
        repo.insert(&op).await.unwrap();
        db.connection()
            .execute(
                "UPDATE offline_operations SET data = '{\"version\":7,\"data\":{}}'",
                (),
            )
            .await
            .unwrap();

        assert!(repo.get(&op.id).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreadable_rows_are_moved_to_failed() {
        let db = setup().await;
        let repo = LibSqlOperationRepository::new(db.connection());

        let broken = operation(Priority::Critical, 1_000);
        let healthy = operation(Priority::Medium, 2_000);
        repo.insert(&broken).await.unwrap();
        repo.insert(&healthy).await.unwrap();
        db.connection()
            .execute(
                "UPDATE offline_operations SET data = '{\"version\":7}' WHERE id = ?",
                [broken.id.as_str()],
            )
            .await
            .unwrap();

        let pending = repo.list_pending(5_000, Priority::Low, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![healthy.id]);

        let mut rows = db
            .connection()
            .query(
                "SELECT retry_count, max_retries, error_message FROM offline_operations
                 WHERE id = ?",
                [broken.id.as_str()],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), row.get::<i64>(1).unwrap());
        let message: String = row.get(2).unwrap();
        assert!(message.starts_with("Unreadable operation"), "{message}");
        drop(rows);

        // Stays out of later passes
        let pending = repo.list_pending(5_000, Priority::Low, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(repo.list_failed().await.unwrap().is_empty());
    }
}
