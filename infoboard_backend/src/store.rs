use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

/// Per-installation blob store that preferences and the snapshot cache persist into.
///
/// Values are opaque strings (JSON in practice); a `set` replaces the whole blob.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed store, one row per blob key.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Create or open the store file, creating parent directories as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create store directory {:?}", parent))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open blob store at {:?}", path))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS kv_blobs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )
        .context("Failed to create kv_blobs table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Blob store lock poisoned: {}", e))
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM kv_blobs WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob '{}'", key)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_blobs (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("Failed to write blob '{}'", key))?;
        Ok(())
    }
}

/// Process-local store, used when nothing should touch disk.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store lock poisoned: {}", e))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store lock poisoned: {}", e))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.set("prefs", r#"{"open":false}"#).unwrap();
            store.set("prefs", r#"{"open":true}"#).unwrap();
        }

        let reopened = SqliteKvStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("prefs").unwrap().as_deref(),
            Some(r#"{"open":true}"#)
        );
        assert!(reopened.get("missing").unwrap().is_none());
    }

    #[test]
    fn memory_store_replaces_whole_value() {
        let store = MemoryKvStore::new();
        assert!(store.get("k").unwrap().is_none());
        store.set("k", "one").unwrap();
        store.set("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));
    }
}
