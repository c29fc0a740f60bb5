//! Key-value repository implementation

use crate::error::Result;
use libsql::Connection;

/// Trait for small scalar and JSON blob storage (async)
#[allow(async_fn_in_trait)]
pub trait KeyValueRepository {
    /// Load the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove every key
    async fn clear(&self) -> Result<()>;

    /// All stored keys in ascending order
    async fn keys(&self) -> Result<Vec<String>>;
}

/// libSQL implementation of `KeyValueRepository`
pub struct LibSqlKeyValueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlKeyValueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl KeyValueRepository for LibSqlKeyValueRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM key_value WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO key_value (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM key_value WHERE key = ?", [key])
            .await?;
        Ok(rows > 0)
    }

    async fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM key_value", ()).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query("SELECT key FROM key_value ORDER BY key ASC", ())
            .await?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            keys.push(row.get::<String>(0)?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_key() {
        let db = setup().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());

        assert_eq!(repo.get("sync_metrics").await.unwrap(), None);
        assert!(!repo.remove("sync_metrics").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_replace_and_list() {
        let db = setup().await;
        let repo = LibSqlKeyValueRepository::new(db.connection());

        repo.set("b", "1").await.unwrap();
        repo.set("a", "2").await.unwrap();
        repo.set("b", "3").await.unwrap();

        assert_eq!(repo.get("b").await.unwrap().as_deref(), Some("3"));
        assert_eq!(repo.keys().await.unwrap(), vec!["a", "b"]);

        repo.clear().await.unwrap();
        assert!(repo.keys().await.unwrap().is_empty());
    }
}
