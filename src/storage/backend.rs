//! Abstract storage trait.
//!
//! Committed WAL entries are handed to a [`KvStore`] exactly in log order.
//! The replication layer never retries a failed apply; failures are
//! logged and the walk moves on, so implementations should make `apply`
//! an idempotent SET.

use std::future::Future;
use std::pin::Pin;

/// Async key/value storage contract.
pub trait KvStore: Send + Sync + 'static {
    /// Short backend name used in logs and the status endpoint.
    fn name(&self) -> &'static str;

    /// Set `key` to `value`.
    fn apply(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read the current value of `key`.
    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;
}
