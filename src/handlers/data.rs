//! Client data API: replicated writes and local reads.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use super::parse_json;
use crate::cluster::message::{Entry, EntryBatch};
use crate::errors::ClusterError;
use crate::AppState;

/// A write body: either `{"data":[..]}` or a bare `{"key":..,"value":..}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WriteBody {
    Batch(EntryBatch),
    Single(Entry),
}

impl WriteBody {
    fn into_entries(self) -> Vec<Entry> {
        match self {
            WriteBody::Batch(batch) => batch.data,
            WriteBody::Single(entry) => vec![entry],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WriteResponse {
    /// Number of entries committed.
    pub written: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ValueResponse {
    pub key: String,
    pub value: String,
}

/// `POST /api/v1/data` -- Replicate one or more writes.
///
/// Entries are submitted in body order; the first failure stops the batch
/// and is returned.
#[utoipa::path(
    post,
    path = "/api/v1/data",
    tag = "Data",
    operation_id = "PutData",
    request_body = EntryBatch,
    responses(
        (status = 201, description = "Entries committed", body = WriteResponse),
        (status = 400, description = "Malformed body or empty key"),
        (status = 503, description = "No leader or no majority")
    )
)]
pub async fn put_data(state: Arc<AppState>, body: &[u8]) -> Result<Response, ClusterError> {
    let entries = parse_json::<WriteBody>(body)?.into_entries();
    if entries.is_empty() {
        return Err(ClusterError::invalid("request body carries no entry"));
    }
    let written = entries.len();
    for entry in entries {
        debug!(key = %entry.key, "client write");
        state.cluster.submit_write(entry).await?;
    }
    Ok((StatusCode::CREATED, Json(WriteResponse { written })).into_response())
}

/// `GET /api/v1/data/{key}` -- Read a value from the local store.
///
/// Reads are served by whichever node receives them and may lag the leader.
#[utoipa::path(
    get,
    path = "/api/v1/data/{key}",
    tag = "Data",
    operation_id = "GetData",
    params(("key" = String, Path, description = "Key to read")),
    responses(
        (status = 200, description = "Stored value", body = ValueResponse),
        (status = 404, description = "No value stored")
    )
)]
pub async fn get_data(state: Arc<AppState>, key: &str) -> Result<Response, ClusterError> {
    match state.cluster.store().get(key).await? {
        Some(value) => Ok(Json(ValueResponse {
            key: key.to_string(),
            value,
        })
        .into_response()),
        None => Err(ClusterError::KeyNotFound {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_body_accepts_batch_and_single() {
        let batch: WriteBody =
            serde_json::from_str(r#"{"data":[{"key":"a","value":"1"},{"key":"b","value":"2"}]}"#)
                .unwrap();
        assert_eq!(batch.into_entries().len(), 2);

        let single: WriteBody = serde_json::from_str(r#"{"key":"a","value":"1"}"#).unwrap();
        assert_eq!(single.into_entries(), vec![Entry::new("a", "1")]);
    }
}
