//! In-memory key/value store.
//!
//! Values live in a `tokio::sync::RwLock<HashMap<..>>`.  Nothing survives
//! a restart; a restarted node is repopulated through catch-up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use super::backend::KvStore;

#[derive(Default)]
pub struct MemoryStore {
    values: tokio::sync::RwLock<HashMap<String, String>>,
    /// Number of `apply` calls, including repeats for the same key.
    applied: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    /// Copy of all stored pairs.
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.values.read().await.clone()
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn apply(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.values.write().await.insert(key, value);
            self.applied.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.values.read().await.get(&key).cloned()) })
    }
}
