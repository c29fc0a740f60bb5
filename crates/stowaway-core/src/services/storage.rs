//! Shared storage handle used by every sync component.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::db::{Database, KeyValueRepository, LibSqlKeyValueRepository};
use crate::Result;

/// Small scalar and JSON blob storage consumed by the status monitor.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Thread-safe owner of the libSQL database.
///
/// Components build repositories while holding [`StorageService::lock`], so a
/// multi-statement update runs as one critical section.
#[derive(Clone)]
pub struct StorageService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl StorageService {
    /// Open a storage service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local database at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_file(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory storage service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Path of the backing file, `None` for in-memory storage.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Acquire exclusive access to the database.
    pub async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.migrate().await
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> Result<i32> {
        let db = self.db.lock().await;
        db.schema_version().await
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_file(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let file_name = db_path
                .file_name()
                .map_or_else(|| "stowaway.db".into(), |name| name.to_string_lossy());
            let backup_path = db_path.with_file_name(format!("{file_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for StorageService {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.remove(key).await.map(|_| ())
    }

    async fn clear(&self) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.clear().await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());
        repo.keys().await
    }
}
