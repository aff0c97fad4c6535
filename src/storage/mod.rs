//! Storage layer committed entries are applied to.
//!
//! The [`backend::KvStore`] trait is the apply boundary.  Implementations
//! hold the values in memory, in SQLite, or forward them to an external
//! storage service over HTTP.

pub mod backend;
pub mod http;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use crate::config::StorageConfig;

/// Build the store selected by `storage.backend`.
pub fn from_config(config: &StorageConfig) -> anyhow::Result<Arc<dyn backend::KvStore>> {
    let store: Arc<dyn backend::KvStore> = match config.backend.as_str() {
        "sqlite" => {
            let path = &config.sqlite.path;
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(sqlite::SqliteStore::new(path)?)
        }
        "http" => Arc::new(http::HttpStore::new(
            &config.http.endpoint,
            Duration::from_millis(config.http.timeout_ms),
        )?),
        "memory" => Arc::new(memory::MemoryStore::new()),
        other => anyhow::bail!("unknown storage.backend '{other}'"),
    };
    Ok(store)
}
