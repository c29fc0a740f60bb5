//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = current_version(conn).await?;

    if version < 1 {
        apply(conn, 1, V1_OPERATION_QUEUE).await?;
    }
    if version < 2 {
        apply(conn, 2, V2_FILE_DOWNLOADS).await?;
    }
    if version < 3 {
        apply(conn, 3, V3_USER_DECISIONS).await?;
    }

    Ok(())
}

/// Get the current schema version
pub async fn current_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: operation queue and key-value store
const V1_OPERATION_QUEUE: &[&str] = &[
    // Schema version tracking
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS offline_operations (
        id TEXT PRIMARY KEY,
        operation_type TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT,
        data TEXT NOT NULL,
        priority INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        scheduled_at INTEGER NOT NULL,
        last_attempt_at INTEGER,
        error_message TEXT,
        conflict_resolution TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_offline_operations_priority
        ON offline_operations(priority DESC, created_at ASC)",
    "CREATE INDEX IF NOT EXISTS idx_offline_operations_scheduled
        ON offline_operations(scheduled_at)",
    // Small scalars and JSON blobs (metrics)
    "CREATE TABLE IF NOT EXISTS key_value (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Version 2: downloaded content tracking
const V2_FILE_DOWNLOADS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS file_downloads (
        id TEXT PRIMARY KEY,
        resource_id TEXT NOT NULL UNIQUE,
        resource_type TEXT NOT NULL,
        file_url TEXT NOT NULL,
        local_path TEXT,
        file_size INTEGER NOT NULL DEFAULT 0,
        downloaded_size INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        progress INTEGER NOT NULL DEFAULT 0,
        priority INTEGER NOT NULL DEFAULT 1,
        error_message TEXT,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        metadata TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_file_downloads_status ON file_downloads(status)",
];

/// Version 3: operations parked for a user conflict decision
const V3_USER_DECISIONS: &[&str] = &[
    "ALTER TABLE offline_operations ADD COLUMN needs_decision INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE offline_operations ADD COLUMN conflict_snapshot TEXT",
    "CREATE INDEX IF NOT EXISTS idx_offline_operations_decision
        ON offline_operations(needs_decision)",
];

/// Apply one migration's statements plus its version row atomically
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            libsql::params![version],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}
