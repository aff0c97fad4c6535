//! Cluster error types.
//!
//! Every variant maps to a stable error code and an HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(ClusterError::StaleTerm { .. })`, and the HTTP peer
//! messenger decodes the same JSON body on the way back in.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::message::{MessageKind, Role};

/// Result type for cluster operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Replication, election and membership errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The message carries a term behind the local term.
    #[error("stale term {received}, local term is {local}")]
    StaleTerm { local: u64, received: u64 },

    /// The local log is more than one entry behind the leader.
    #[error("follower at index {local_index} is behind leader index {leader_index}")]
    StaleFollower { local_index: u64, leader_index: u64 },

    /// The leader claims an index at or behind the local log.
    #[error("leader index {leader_index} is not ahead of local index {local_index}")]
    LeaderBehind { local_index: u64, leader_index: u64 },

    /// Fewer than two peers are registered.
    #[error("at least 2 peers besides this node are required, {count} registered")]
    InsufficientPeers { count: usize },

    /// The number of peers (excluding self) must be even.
    #[error("an even number of peers besides this node is required, {count} registered")]
    OddPeerCountRequired { count: usize },

    /// The AppendEntries fan-out did not reach a majority.
    #[error("replication reached {acks} of {majority} required acknowledgements")]
    QuorumNotReached { acks: usize, majority: usize },

    /// Commit application found an unfilled WAL slot.
    #[error("write-ahead log has no entry at index {index}")]
    WalHole { index: u64 },

    /// A commit arrived for entries this node has not received yet.
    #[error("commit index {commit_index} is past local log index {log_index}")]
    NotUpToDate { commit_index: u64, log_index: u64 },

    /// The address is already a registered cluster member.
    #[error("node {address} is already registered")]
    AlreadyRegistered { address: String },

    /// The address is not a registered cluster member.
    #[error("node {address} is not registered")]
    NotRegistered { address: String },

    /// No leader is known for the current term.
    #[error("no leader is known")]
    NoLeader,

    /// A client write reached a node that is not the leader.
    #[error("this node is not the leader (leader: {leader:?})")]
    NotLeader { leader: String },

    /// The node is campaigning and cannot serve the data path.
    #[error("an election is in progress")]
    ElectionInProgress,

    /// The event loop has not been started.
    #[error("cluster event loop is not running")]
    NotRunning,

    /// The active role does not handle this message.
    #[error("{role} does not accept {kind} messages")]
    UnexpectedMessage { role: Role, kind: MessageKind },

    /// The local store holds no value for the key.
    #[error("no value stored for key {key:?}")]
    KeyNotFound { key: String },

    /// A request was missing a field or carried a malformed one.
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Missing or wrong internal token on a peer route.
    #[error("internal token missing or invalid")]
    Unauthorized,

    /// The handler dropped the reply channel without answering.
    #[error("request was dropped before a reply was sent")]
    NoReply,

    /// The peer could not be reached.
    #[error("peer {peer} unreachable: {message}")]
    Peer { peer: String, message: String },

    /// The peer answered with an error.
    #[error("peer {peer} rejected the request ({code}): {message}")]
    Remote {
        peer: String,
        code: String,
        message: String,
    },

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClusterError {
    /// Shorthand for [`ClusterError::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        ClusterError::InvalidRequest {
            message: message.into(),
        }
    }

    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::StaleTerm { .. } => "StaleTerm",
            ClusterError::StaleFollower { .. } => "StaleFollower",
            ClusterError::LeaderBehind { .. } => "LeaderBehind",
            ClusterError::InsufficientPeers { .. } => "InsufficientPeers",
            ClusterError::OddPeerCountRequired { .. } => "OddPeerCountRequired",
            ClusterError::QuorumNotReached { .. } => "QuorumNotReached",
            ClusterError::WalHole { .. } => "WalHole",
            ClusterError::NotUpToDate { .. } => "NotUpToDate",
            ClusterError::AlreadyRegistered { .. } => "AlreadyRegistered",
            ClusterError::NotRegistered { .. } => "NotRegistered",
            ClusterError::NoLeader => "NoLeader",
            ClusterError::NotLeader { .. } => "NotLeader",
            ClusterError::ElectionInProgress => "ElectionInProgress",
            ClusterError::NotRunning => "NotRunning",
            ClusterError::UnexpectedMessage { .. } => "UnexpectedMessage",
            ClusterError::KeyNotFound { .. } => "NoSuchKey",
            ClusterError::InvalidRequest { .. } => "InvalidRequest",
            ClusterError::Unauthorized => "Unauthorized",
            ClusterError::NoReply => "NoReply",
            ClusterError::Peer { .. } => "PeerUnreachable",
            ClusterError::Remote { .. } => "PeerRejected",
            ClusterError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClusterError::StaleTerm { .. } => StatusCode::CONFLICT,
            ClusterError::StaleFollower { .. } => StatusCode::CONFLICT,
            ClusterError::LeaderBehind { .. } => StatusCode::CONFLICT,
            ClusterError::InsufficientPeers { .. } => StatusCode::BAD_REQUEST,
            ClusterError::OddPeerCountRequired { .. } => StatusCode::BAD_REQUEST,
            ClusterError::QuorumNotReached { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::WalHole { .. } => StatusCode::CONFLICT,
            ClusterError::NotUpToDate { .. } => StatusCode::CONFLICT,
            ClusterError::AlreadyRegistered { .. } => StatusCode::CONFLICT,
            ClusterError::NotRegistered { .. } => StatusCode::NOT_FOUND,
            ClusterError::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            ClusterError::ElectionInProgress => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::UnexpectedMessage { .. } => StatusCode::BAD_REQUEST,
            ClusterError::KeyNotFound { .. } => StatusCode::NOT_FOUND,
            ClusterError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ClusterError::Unauthorized => StatusCode::UNAUTHORIZED,
            ClusterError::NoReply => StatusCode::INTERNAL_SERVER_ERROR,
            ClusterError::Peer { .. } => StatusCode::BAD_GATEWAY,
            ClusterError::Remote { .. } => StatusCode::BAD_GATEWAY,
            ClusterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body shared by the server and the HTTP peer messenger.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (
            status,
            [("x-request-id", generate_request_id())],
            axum::Json(body),
        )
            .into_response()
    }
}
