//! HTTP handlers for the peer protocol and the client data API.

pub mod cluster;
pub mod data;

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::errors::{ClusterError, ClusterResult};

/// Read a required string header.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> ClusterResult<&'a str> {
    headers
        .get(name)
        .ok_or_else(|| ClusterError::invalid(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| ClusterError::invalid(format!("{name} header is not valid text")))
}

/// Read a required unsigned integer header.
pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> ClusterResult<u64> {
    let raw = header_str(headers, name)?;
    raw.trim().parse().map_err(|_| {
        ClusterError::invalid(format!(
            "{name} header must be an unsigned integer, got {raw:?}"
        ))
    })
}

/// Decode a JSON request body, reporting failures as `InvalidRequest`.
pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> ClusterResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ClusterError::invalid(format!("malformed JSON body: {e}")))
}
