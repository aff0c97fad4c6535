//! SQLite key/value store.
//!
//! Applied entries are kept in a single `kv` table so a node's applied
//! state survives restarts.
//!
//! Because `rusqlite::Connection` is `!Send`, we wrap it in a
//! `std::sync::Mutex` behind an `Arc` and use `tokio::task::spawn_blocking`
//! for every database operation.

use rusqlite::{params, Connection, OptionalExtension};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use super::backend::KvStore;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `db_path` and initialise
    /// the `kv` table.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (\
                 key        TEXT PRIMARY KEY,\
                 value      TEXT NOT NULL,\
                 updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))\
             );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl KvStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn apply(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                    params![key, value],
                )?;
                Ok::<(), anyhow::Error>(())
            })
            .await??;
            Ok(())
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            let value = tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                let value: Option<String> = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok::<Option<String>, anyhow::Error>(value)
            })
            .await??;
            Ok(value)
        })
    }
}
