//! Outbound peer protocol.
//!
//! [`PeerMessenger`] is the egress seam of the replication layer: every
//! call a node makes to another node goes through it.  [`HttpMessenger`]
//! speaks the HTTP wire protocol served by `handlers::cluster`; tests plug
//! in an in-process network instead.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::message::{Entry, EntryBatch, Heartbeat};
use crate::errors::{ClusterError, ClusterResult, ErrorBody};

pub const TERM_HEADER: &str = "x-raft-term";
pub const LEADER_HEADER: &str = "x-raft-leader";
pub const INDEX_HEADER: &str = "x-raft-index";
pub const COMMIT_INDEX_HEADER: &str = "x-raft-commit-index";
pub const ORIGIN_HEADER: &str = "x-raft-origin";
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

/// Catch-up requests stay open while the leader streams every missing
/// entry, so they get a longer budget than single calls.
const CATCH_UP_TIMEOUT: Duration = Duration::from_secs(30);

pub type PeerFuture<'a> = Pin<Box<dyn Future<Output = ClusterResult<()>> + Send + 'a>>;

/// One replicated entry as sent by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: String,
    /// Index the entry occupies in the leader's log.
    pub leader_index: u64,
    pub entry: Entry,
}

/// Body of a registration request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterBody {
    pub address: String,
}

/// Calls a node makes to its peers.  `Ok(())` means the peer accepted the
/// request; any rejection or transport failure is an error.
pub trait PeerMessenger: Send + Sync + 'static {
    /// Ask `peer` for its vote in `term`.
    fn request_vote(&self, peer: &str, term: u64) -> PeerFuture<'_>;

    /// Replicate one entry to `peer`.
    fn append_entry(&self, peer: &str, request: AppendRequest) -> PeerFuture<'_>;

    /// Hand a client write to the leader.
    fn forward_to_leader(&self, leader: &str, entry: Entry) -> PeerFuture<'_>;

    fn heartbeat(&self, peer: &str, heartbeat: Heartbeat) -> PeerFuture<'_>;

    fn commit(&self, peer: &str, commit_index: u64, term: u64) -> PeerFuture<'_>;

    /// Ask the leader to stream every entry after `from_index` back to
    /// `origin`.  Resolves once the stream has finished.
    fn request_catch_up(&self, leader: &str, from_index: u64, origin: &str) -> PeerFuture<'_>;

    /// Deliver one catch-up entry at an explicit index.
    fn push_entry(&self, peer: &str, index: u64, entry: Entry) -> PeerFuture<'_>;

    /// Register `address` with `target`.  With `handshake`, the target
    /// registers itself back with `address`.
    fn register(&self, target: &str, address: &str, handshake: bool) -> PeerFuture<'_>;

    /// Tell `target` to start its event loop.
    fn start_cluster(&self, target: &str) -> PeerFuture<'_>;
}

/// [`PeerMessenger`] over HTTP/JSON using `reqwest`.
pub struct HttpMessenger {
    client: reqwest::Client,
    internal_token: String,
}

impl HttpMessenger {
    pub fn new(timeout: Duration, internal_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            internal_token: internal_token.into(),
        })
    }

    fn url(peer: &str, path: &str) -> String {
        if peer.starts_with("http://") || peer.starts_with("https://") {
            format!("{}{}", peer.trim_end_matches('/'), path)
        } else {
            format!("http://{peer}{path}")
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        peer: &str,
        path: &str,
    ) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, Self::url(peer, path));
        if self.internal_token.is_empty() {
            builder
        } else {
            builder.header(INTERNAL_TOKEN_HEADER, &self.internal_token)
        }
    }

    async fn send(peer: String, builder: reqwest::RequestBuilder) -> ClusterResult<()> {
        let response = builder.send().await.map_err(|e| ClusterError::Peer {
            peer: peer.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let err = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => ClusterError::Remote {
                peer,
                code: body.code,
                message: body.message,
            },
            Err(_) => ClusterError::Remote {
                peer,
                code: status.as_u16().to_string(),
                message: text,
            },
        };
        Err(err)
    }
}

impl PeerMessenger for HttpMessenger {
    fn request_vote(&self, peer: &str, term: u64) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::GET, peer, "/api/v1/cluster/election")
            .header(TERM_HEADER, term.to_string());
        Box::pin(Self::send(peer.to_string(), builder))
    }

    fn append_entry(&self, peer: &str, request: AppendRequest) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::POST, peer, "/api/v1/cluster/wal/leader")
            .header(TERM_HEADER, request.term.to_string())
            .header(LEADER_HEADER, request.leader)
            .header(INDEX_HEADER, request.leader_index.to_string())
            .json(&EntryBatch::single(request.entry));
        Box::pin(Self::send(peer.to_string(), builder))
    }

    fn forward_to_leader(&self, leader: &str, entry: Entry) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::POST, leader, "/api/v1/cluster/wal")
            .json(&EntryBatch::single(entry));
        Box::pin(Self::send(leader.to_string(), builder))
    }

    fn heartbeat(&self, peer: &str, heartbeat: Heartbeat) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::GET, peer, "/api/v1/cluster/heartbeat")
            .header(TERM_HEADER, heartbeat.term.to_string())
            .header(LEADER_HEADER, heartbeat.leader)
            .header(INDEX_HEADER, heartbeat.leader_index.to_string())
            .header(COMMIT_INDEX_HEADER, heartbeat.commit_index.to_string());
        Box::pin(Self::send(peer.to_string(), builder))
    }

    fn commit(&self, peer: &str, commit_index: u64, term: u64) -> PeerFuture<'_> {
        let path = format!("/api/v1/cluster/commit/{commit_index}");
        let builder = self
            .request(reqwest::Method::GET, peer, &path)
            .header(TERM_HEADER, term.to_string());
        Box::pin(Self::send(peer.to_string(), builder))
    }

    fn request_catch_up(&self, leader: &str, from_index: u64, origin: &str) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::GET, leader, "/api/v1/cluster/update")
            .header(INDEX_HEADER, from_index.to_string())
            .header(ORIGIN_HEADER, origin)
            .timeout(CATCH_UP_TIMEOUT);
        Box::pin(Self::send(leader.to_string(), builder))
    }

    fn push_entry(&self, peer: &str, index: u64, entry: Entry) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::POST, peer, "/api/v1/cluster/update")
            .header(INDEX_HEADER, index.to_string())
            .json(&EntryBatch::single(entry));
        Box::pin(Self::send(peer.to_string(), builder))
    }

    fn register(&self, target: &str, address: &str, handshake: bool) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::POST, target, "/api/v1/cluster")
            .query(&[
                ("handshake", handshake.to_string()),
                ("startPoint", "false".to_string()),
            ])
            .json(&RegisterBody {
                address: address.to_string(),
            });
        Box::pin(Self::send(target.to_string(), builder))
    }

    fn start_cluster(&self, target: &str) -> PeerFuture<'_> {
        let builder = self
            .request(reqwest::Method::PUT, target, "/api/v1/cluster")
            .query(&[("startPoint", "false")]);
        Box::pin(Self::send(target.to_string(), builder))
    }
}
