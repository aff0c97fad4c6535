//! Peer protocol and membership handlers under `/api/v1/cluster`.
//!
//! Protocol fields travel in `x-raft-*` headers; entries travel in an
//! `{"data":[..]}` body.  Every acknowledged protocol message answers
//! `204 No Content`.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;

use super::{header_str, header_u64, parse_json};
use crate::cluster::message::{EntryBatch, Heartbeat, LeaderHeader};
use crate::cluster::messenger::{
    RegisterBody, COMMIT_INDEX_HEADER, INDEX_HEADER, LEADER_HEADER, ORIGIN_HEADER, TERM_HEADER,
};
use crate::cluster::state::NodeStatus;
use crate::errors::ClusterError;
use crate::AppState;

/// Query string of `POST /api/v1/cluster`.
#[derive(Debug, Default, Deserialize)]
pub struct RegisterQuery {
    #[serde(default)]
    pub handshake: bool,
    #[serde(default, rename = "startPoint")]
    pub start_point: bool,
}

/// Query string of `PUT /api/v1/cluster`.
#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    #[serde(default, rename = "startPoint")]
    pub start_point: bool,
}

/// Query string of `DELETE /api/v1/cluster`.
#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub address: String,
}

/// Registered cluster members as seen by this node.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NodesResponse {
    pub address: String,
    pub peers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LeaderResponse {
    /// `null` while no leader is known.
    pub leader: Option<String>,
}

fn acknowledged() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

fn nodes(state: &AppState) -> NodesResponse {
    NodesResponse {
        address: state.cluster.self_address().to_string(),
        peers: state.cluster.peers(),
    }
}

// -- Membership and admin -----------------------------------------------------

/// `POST /api/v1/cluster` -- Register a node.
#[utoipa::path(
    post,
    path = "/api/v1/cluster",
    tag = "Membership",
    operation_id = "RegisterNode",
    params(
        ("handshake" = Option<bool>, Query, description = "Register back with the new node"),
        ("startPoint" = Option<bool>, Query, description = "Act as the entry point and tell every peer")
    ),
    request_body = RegisterBody,
    responses(
        (status = 200, description = "Node registered", body = NodesResponse),
        (status = 409, description = "Node already registered"),
        (status = 502, description = "A peer could not be reached")
    )
)]
pub async fn register(
    state: Arc<AppState>,
    query: RegisterQuery,
    body: &[u8],
) -> Result<Response, ClusterError> {
    let RegisterBody { address } = parse_json(body)?;
    info!(
        %address,
        handshake = query.handshake,
        start_point = query.start_point,
        "registration request"
    );
    state
        .cluster
        .handle_registration(&address, query.handshake, query.start_point)
        .await?;
    Ok(Json(nodes(&state)).into_response())
}

/// `PUT /api/v1/cluster` -- Start this node's event loop.
#[utoipa::path(
    put,
    path = "/api/v1/cluster",
    tag = "Membership",
    operation_id = "StartNode",
    params(
        ("startPoint" = Option<bool>, Query, description = "Also tell every peer to start")
    ),
    responses(
        (status = 200, description = "Node started"),
        (status = 400, description = "Peer count does not allow a quorum")
    )
)]
pub async fn start(state: Arc<AppState>, query: StartQuery) -> Result<Response, ClusterError> {
    state.cluster.start(query.start_point).await?;
    Ok(Json(state.cluster.status()).into_response())
}

/// `DELETE /api/v1/cluster?address=..` -- Forget a registered peer.
///
/// Only this node's view changes; other members keep the peer listed.
#[utoipa::path(
    delete,
    path = "/api/v1/cluster",
    tag = "Membership",
    operation_id = "RemoveNode",
    params(
        ("address" = String, Query, description = "Peer address to forget")
    ),
    responses(
        (status = 200, description = "Peer removed", body = NodesResponse),
        (status = 404, description = "Peer not registered")
    )
)]
pub async fn remove_node(
    state: Arc<AppState>,
    query: RemoveQuery,
) -> Result<Response, ClusterError> {
    state.cluster.remove_peer(&query.address)?;
    Ok(Json(nodes(&state)).into_response())
}

/// `GET /api/v1/cluster` -- Registered nodes.
#[utoipa::path(
    get,
    path = "/api/v1/cluster",
    tag = "Membership",
    operation_id = "ListNodes",
    responses((status = 200, description = "Registered nodes", body = NodesResponse))
)]
pub async fn list_nodes(state: Arc<AppState>) -> Result<Response, ClusterError> {
    Ok(Json(nodes(&state)).into_response())
}

/// `GET /api/v1/cluster/leader` -- The leader this node knows of.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/leader",
    tag = "Membership",
    operation_id = "GetLeader",
    responses((status = 200, description = "Known leader", body = LeaderResponse))
)]
pub async fn leader(state: Arc<AppState>) -> Result<Response, ClusterError> {
    Ok(Json(LeaderResponse {
        leader: state.cluster.leader(),
    })
    .into_response())
}

/// `GET /api/v1/cluster/status` -- Role, term and indices.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/status",
    tag = "Membership",
    operation_id = "GetStatus",
    responses((status = 200, description = "Node status", body = NodeStatus))
)]
pub async fn status(state: Arc<AppState>) -> Result<Response, ClusterError> {
    Ok(Json(state.cluster.status()).into_response())
}

// -- Replication --------------------------------------------------------------

/// `POST /api/v1/cluster/wal` -- A write forwarded by a follower.
#[utoipa::path(
    post,
    path = "/api/v1/cluster/wal",
    tag = "Replication",
    operation_id = "ForwardedWrite",
    request_body = EntryBatch,
    responses(
        (status = 204, description = "Entry committed"),
        (status = 421, description = "This node is not the leader"),
        (status = 503, description = "Majority not reached")
    )
)]
pub async fn forwarded_write(state: Arc<AppState>, body: &[u8]) -> Result<Response, ClusterError> {
    let entry = parse_json::<EntryBatch>(body)?.into_first()?;
    state.cluster.dispatcher().client_append(entry).await?;
    Ok(acknowledged())
}

/// `POST /api/v1/cluster/wal/leader` -- AppendEntries from the leader.
#[utoipa::path(
    post,
    path = "/api/v1/cluster/wal/leader",
    tag = "Replication",
    operation_id = "AppendEntries",
    params(
        ("x-raft-term" = u64, Header, description = "Leader term"),
        ("x-raft-leader" = String, Header, description = "Leader address"),
        ("x-raft-index" = u64, Header, description = "Index of the entry in the leader's log")
    ),
    request_body = EntryBatch,
    responses(
        (status = 204, description = "Entry accepted"),
        (status = 409, description = "Stale term or index mismatch")
    )
)]
pub async fn append_entries(
    state: Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ClusterError> {
    let header = LeaderHeader {
        term: header_u64(headers, TERM_HEADER)?,
        leader: header_str(headers, LEADER_HEADER)?.to_string(),
        leader_index: header_u64(headers, INDEX_HEADER)?,
    };
    let entry = parse_json::<EntryBatch>(body)?.into_first()?;
    state.cluster.dispatcher().leader_append(header, entry).await?;
    Ok(acknowledged())
}

/// `GET /api/v1/cluster/update` -- Catch-up request from a lagging follower.
///
/// Answers only after every missing entry has been pushed to the origin.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/update",
    tag = "Replication",
    operation_id = "CatchUpRequest",
    params(
        ("x-raft-index" = u64, Header, description = "Last index the follower holds"),
        ("x-raft-origin" = String, Header, description = "Address to stream entries to")
    ),
    responses(
        (status = 204, description = "All missing entries delivered"),
        (status = 409, description = "The follower is not behind this leader")
    )
)]
pub async fn catch_up(state: Arc<AppState>, headers: &HeaderMap) -> Result<Response, ClusterError> {
    let from_index = header_u64(headers, INDEX_HEADER)?;
    let origin = header_str(headers, ORIGIN_HEADER)?.to_string();
    debug!(%origin, from_index, "catch-up requested");
    state
        .cluster
        .dispatcher()
        .catch_up_request(from_index, origin)
        .await?;
    Ok(acknowledged())
}

/// `POST /api/v1/cluster/update` -- One entry of a catch-up stream.
#[utoipa::path(
    post,
    path = "/api/v1/cluster/update",
    tag = "Replication",
    operation_id = "CatchUpEntry",
    params(("x-raft-index" = u64, Header, description = "Index the entry belongs at")),
    request_body = EntryBatch,
    responses((status = 204, description = "Entry stored"))
)]
pub async fn update_entry(
    state: Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ClusterError> {
    let index = header_u64(headers, INDEX_HEADER)?;
    let entry = parse_json::<EntryBatch>(body)?.into_first()?;
    state.cluster.dispatcher().update_entry(index, entry).await?;
    Ok(acknowledged())
}

/// `GET /api/v1/cluster/commit/{index}` -- Commit up to `index`.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/commit/{index}",
    tag = "Replication",
    operation_id = "Commit",
    params(
        ("index" = u64, Path, description = "New commit index"),
        ("x-raft-term" = u64, Header, description = "Leader term")
    ),
    responses(
        (status = 204, description = "Committed entries applied"),
        (status = 409, description = "Stale term, hole or missing entries")
    )
)]
pub async fn commit(
    state: Arc<AppState>,
    index: u64,
    headers: &HeaderMap,
) -> Result<Response, ClusterError> {
    let term = header_u64(headers, TERM_HEADER)?;
    state.cluster.dispatcher().commit(index, term).await?;
    Ok(acknowledged())
}

/// `GET /api/v1/cluster/heartbeat` -- Leader heartbeat or election result.
///
/// Starts a stopped node whose membership allows a quorum.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/heartbeat",
    tag = "Replication",
    operation_id = "Heartbeat",
    params(
        ("x-raft-term" = u64, Header, description = "Leader term"),
        ("x-raft-leader" = String, Header, description = "Leader address"),
        ("x-raft-index" = u64, Header, description = "Leader log index"),
        ("x-raft-commit-index" = u64, Header, description = "Leader commit index")
    ),
    responses(
        (status = 204, description = "Heartbeat accepted"),
        (status = 409, description = "Stale term")
    )
)]
pub async fn heartbeat(state: Arc<AppState>, headers: &HeaderMap) -> Result<Response, ClusterError> {
    let heartbeat = Heartbeat {
        term: header_u64(headers, TERM_HEADER)?,
        leader: header_str(headers, LEADER_HEADER)?.to_string(),
        leader_index: header_u64(headers, INDEX_HEADER)?,
        commit_index: header_u64(headers, COMMIT_INDEX_HEADER)?,
    };
    state.cluster.accept_heartbeat(heartbeat).await?;
    Ok(acknowledged())
}

/// `GET /api/v1/cluster/election` -- Vote request.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/election",
    tag = "Election",
    operation_id = "RequestVote",
    params(("x-raft-term" = u64, Header, description = "Candidate term")),
    responses(
        (status = 204, description = "Vote granted"),
        (status = 409, description = "Vote refused for this term")
    )
)]
pub async fn election(state: Arc<AppState>, headers: &HeaderMap) -> Result<Response, ClusterError> {
    let term = header_u64(headers, TERM_HEADER)?;
    state.cluster.dispatcher().vote_request(term).await?;
    Ok(acknowledged())
}
