//! Content download repository implementation

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::{DownloadRecord, DownloadStatus, Priority};
use libsql::Connection;
use serde_json::Value;

use super::values::{
    nullable_integer, nullable_text, optional_integer, optional_text, to_sql_integer, unsigned,
};

const SELECT_COLUMNS: &str = "SELECT id, resource_id, resource_type, file_url, local_path,
        file_size, downloaded_size, status, progress, priority, error_message, started_at,
        completed_at, metadata
     FROM file_downloads";

/// Trait for download record storage (async)
#[allow(async_fn_in_trait)]
pub trait DownloadRepository {
    /// Insert or replace the record for a resource
    async fn upsert(&self, record: &DownloadRecord) -> Result<()>;

    /// Get the record for a resource
    async fn get(&self, resource_id: &str) -> Result<Option<DownloadRecord>>;

    /// Every record, oldest first
    async fn list_all(&self) -> Result<Vec<DownloadRecord>>;

    /// Records in the given state, oldest first
    async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>>;

    /// Completed records in eviction order: lowest priority, then oldest
    async fn list_eviction_candidates(&self) -> Result<Vec<DownloadRecord>>;

    /// Bytes held by completed downloads
    async fn completed_bytes(&self) -> Result<u64>;

    /// Expected bytes of unfinished downloads other than `except`
    async fn reserved_bytes(&self, except: &str) -> Result<u64>;

    /// Change state, recording an error or completion time when given
    async fn update_status(
        &self,
        resource_id: &str,
        status: DownloadStatus,
        error: Option<&str>,
        completed_at: Option<i64>,
    ) -> Result<()>;

    /// Store byte counters for an in-flight download
    async fn update_progress(
        &self,
        resource_id: &str,
        downloaded: u64,
        total: u64,
        progress: u8,
    ) -> Result<()>;

    /// Mark a download completed at `local_path`
    async fn complete(
        &self,
        resource_id: &str,
        local_path: &Path,
        size: u64,
        completed_at: i64,
    ) -> Result<()>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, resource_id: &str) -> Result<bool>;
}

/// libSQL implementation of `DownloadRepository`
pub struct LibSqlDownloadRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlDownloadRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<DownloadRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    /// Parse a download record from a database row
    fn parse_record(row: &libsql::Row) -> Result<DownloadRecord> {
        let resource_type: String = row.get(2)?;
        let status: String = row.get(7)?;
        let progress = unsigned(row, 8)?;
        let metadata = optional_text(row, 13)?
            .map(|value| serde_json::from_str::<Value>(&value))
            .transpose()?;

        Ok(DownloadRecord {
            id: row.get(0)?,
            resource_id: row.get(1)?,
            resource_type: resource_type.parse()?,
            url: row.get(3)?,
            local_path: optional_text(row, 4)?.map(PathBuf::from),
            file_size: unsigned(row, 5)?,
            downloaded_size: unsigned(row, 6)?,
            status: status.parse()?,
            progress: u8::try_from(progress.min(100)).unwrap_or(100),
            priority: Priority::from_rank(row.get(9)?),
            error: optional_text(row, 10)?,
            started_at: row.get(11)?,
            completed_at: optional_integer(row, 12)?,
            metadata,
        })
    }
}

impl DownloadRepository for LibSqlDownloadRepository<'_> {
    async fn upsert(&self, record: &DownloadRecord) -> Result<()> {
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO file_downloads (
                    id, resource_id, resource_type, file_url, local_path, file_size,
                    downloaded_size, status, progress, priority, error_message, started_at,
                    completed_at, metadata
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                libsql::params![
                    record.id.as_str(),
                    record.resource_id.as_str(),
                    record.resource_type.as_str(),
                    record.url.as_str(),
                    nullable_text(
                        record
                            .local_path
                            .as_ref()
                            .map(|path| path.to_string_lossy().to_string())
                    ),
                    to_sql_integer(record.file_size),
                    to_sql_integer(record.downloaded_size),
                    record.status.as_str(),
                    i64::from(record.progress),
                    record.priority.rank(),
                    nullable_text(record.error.clone()),
                    record.started_at,
                    nullable_integer(record.completed_at),
                    nullable_text(metadata),
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, resource_id: &str) -> Result<Option<DownloadRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE resource_id = ?");
        let mut records = self.query_records(&sql, [resource_id]).await?;
        Ok(records.pop())
    }

    async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY started_at ASC, rowid ASC");
        self.query_records(&sql, ()).await
    }

    async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY started_at ASC, rowid ASC");
        self.query_records(&sql, [status.as_str()]).await
    }

    async fn list_eviction_candidates(&self) -> Result<Vec<DownloadRecord>> {
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE status = 'completed'
             ORDER BY priority ASC, COALESCE(completed_at, started_at) ASC, rowid ASC"
        );
        self.query_records(&sql, ()).await
    }

    async fn completed_bytes(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(file_size), 0) FROM file_downloads WHERE status = 'completed'",
                (),
            )
            .await?;

        if let Some(row) = rows.next().await? {
            unsigned(&row, 0)
        } else {
            Ok(0)
        }
    }

    async fn reserved_bytes(&self, except: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(file_size), 0) FROM file_downloads
                 WHERE status IN ('pending', 'downloading', 'paused') AND resource_id != ?",
                [except],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            unsigned(&row, 0)
        } else {
            Ok(0)
        }
    }

    async fn update_status(
        &self,
        resource_id: &str,
        status: DownloadStatus,
        error: Option<&str>,
        completed_at: Option<i64>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE file_downloads
                 SET status = ?, error_message = ?, completed_at = COALESCE(?, completed_at)
                 WHERE resource_id = ?",
                libsql::params![
                    status.as_str(),
                    nullable_text(error.map(ToString::to_string)),
                    nullable_integer(completed_at),
                    resource_id
                ],
            )
            .await?;
        Ok(())
    }

    async fn update_progress(
        &self,
        resource_id: &str,
        downloaded: u64,
        total: u64,
        progress: u8,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE file_downloads
                 SET downloaded_size = ?, file_size = MAX(file_size, ?), progress = ?
                 WHERE resource_id = ?",
                libsql::params![
                    to_sql_integer(downloaded),
                    to_sql_integer(total),
                    i64::from(progress),
                    resource_id
                ],
            )
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        resource_id: &str,
        local_path: &Path,
        size: u64,
        completed_at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE file_downloads
                 SET status = 'completed', local_path = ?, file_size = ?, downloaded_size = ?,
                     progress = 100, error_message = NULL, completed_at = ?
                 WHERE resource_id = ?",
                libsql::params![
                    local_path.to_string_lossy().to_string(),
                    to_sql_integer(size),
                    to_sql_integer(size),
                    completed_at,
                    resource_id
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, resource_id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM file_downloads WHERE resource_id = ?",
                [resource_id],
            )
            .await?;
        Ok(rows > 0)
    }
}
