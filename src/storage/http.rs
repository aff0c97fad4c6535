//! HTTP-forwarding key/value store.
//!
//! Committed entries are POSTed to an external storage service at
//! `{endpoint}/api/v1/hash/data` as `{"data":[{"key":..,"value":..}]}`, and
//! reads go to `GET {endpoint}/api/v1/hash/data/{key}`.  This is the seam
//! where a sharded storage engine plugs in behind the replication layer.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::backend::KvStore;
use crate::cluster::message::{Entry, EntryBatch};

/// Header telling the storage service the write already went through
/// replication and must not be replicated again.
pub const PASS_TO_STORE_HEADER: &str = "x-pass-to-store";

pub struct HttpStore {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ValueBody {
    value: String,
}

impl HttpStore {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn data_url(&self) -> String {
        format!("{}/api/v1/hash/data", self.endpoint)
    }
}

impl KvStore for HttpStore {
    fn name(&self) -> &'static str {
        "http"
    }

    fn apply(
        &self,
        key: &str,
        value: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let body = EntryBatch::single(Entry::new(key, value));
        Box::pin(async move {
            let response = self
                .client
                .post(self.data_url())
                .header(PASS_TO_STORE_HEADER, "true")
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                anyhow::bail!(
                    "storage service rejected write ({})",
                    response.status()
                );
            }
            Ok(())
        })
    }

    fn get(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let url = format!("{}/{}", self.data_url(), key);
        Box::pin(async move {
            let response = self.client.get(url).send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    let body: ValueBody = response.json().await?;
                    Ok(Some(body.value))
                }
                status => anyhow::bail!("storage service read failed ({status})"),
            }
        })
    }
}
