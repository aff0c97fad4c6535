//! Event model carried on the node's single event channel.
//!
//! Every inbound request, every timer-driven self-message and every peer
//! response re-enters the state machine as an [`Event`].  Requests that
//! expect an answer carry a [`Reply`], which is answered exactly once.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use utoipa::ToSchema;

use crate::errors::{ClusterError, ClusterResult};

/// Role of a node in the replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Stopped,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Stopped => "stopped",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// A key/value mutation as stored in the write-ahead log.
///
/// An empty key marks a slot that has not been filled yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether this slot holds a real mutation.
    pub fn is_filled(&self) -> bool {
        !self.key.is_empty()
    }
}

/// Wire form of entries in request bodies: `{"data":[{"key":..,"value":..}]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct EntryBatch {
    pub data: Vec<Entry>,
}

impl EntryBatch {
    pub fn single(entry: Entry) -> Self {
        Self { data: vec![entry] }
    }

    /// The first entry, or `InvalidRequest` when the batch is empty.
    pub fn into_first(self) -> ClusterResult<Entry> {
        self.data
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::invalid("request body carries no entry"))
    }
}

/// Header fields a leader attaches to a replicated entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderHeader {
    pub term: u64,
    pub leader: String,
    /// The leader's log index after appending this entry.
    pub leader_index: u64,
}

/// Where an `AppendEntry` came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOrigin {
    /// A client write, either local or forwarded by a follower.
    Client,
    /// Replication from the leader.
    Leader(LeaderHeader),
}

/// Leader state broadcast on every heartbeat tick and on election wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub term: u64,
    pub leader: String,
    pub leader_index: u64,
    pub commit_index: u64,
}

/// Discriminant of [`Event`], used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    AppendEntry,
    ToLeader,
    UpdateEntry,
    CatchUpRequest,
    VoteRequest,
    ElectionResult,
    Commit,
    Heartbeat,
    UpdateFinished,
    Shutdown,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::AppendEntry => "append_entry",
            MessageKind::ToLeader => "to_leader",
            MessageKind::UpdateEntry => "update_entry",
            MessageKind::CatchUpRequest => "catch_up_request",
            MessageKind::VoteRequest => "vote_request",
            MessageKind::ElectionResult => "election_result",
            MessageKind::Commit => "commit",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::UpdateFinished => "update_finished",
            MessageKind::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Single-use reply channel.
///
/// Answering consumes the `Reply`.  A `Reply` dropped without an answer
/// sends [`ClusterError::NoReply`], so the waiting caller is always
/// released.
#[derive(Debug)]
pub struct Reply {
    tx: Option<oneshot::Sender<ClusterResult<()>>>,
}

impl Reply {
    /// Create a reply handle and the receiver the caller awaits.
    pub fn channel() -> (Reply, oneshot::Receiver<ClusterResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Reply { tx: Some(tx) }, rx)
    }

    /// Send the outcome to the caller.
    pub fn send(mut self, result: ClusterResult<()>) {
        if let Some(tx) = self.tx.take() {
            // The caller may have given up waiting.
            let _ = tx.send(result);
        }
    }

    pub fn ok(self) {
        self.send(Ok(()));
    }

    pub fn err(self, err: ClusterError) {
        self.send(Err(err));
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(ClusterError::NoReply));
        }
    }
}

/// A message consumed by the active role loop.
#[derive(Debug)]
pub enum Event {
    /// Append an entry: a new client write on the leader, replication on a follower.
    AppendEntry {
        entry: Entry,
        origin: EntryOrigin,
        reply: Reply,
    },
    /// Forward a client write to the known leader.
    ToLeader { entry: Entry, reply: Reply },
    /// Leader pushing one catch-up entry at an explicit index.
    UpdateEntry {
        index: u64,
        entry: Entry,
        reply: Reply,
    },
    /// Follower asking the leader for entries after `from_index`.
    CatchUpRequest {
        from_index: u64,
        origin: String,
        reply: Reply,
    },
    /// Candidate asking for a vote in `term`.
    VoteRequest { term: u64, reply: Reply },
    /// A peer granted this node's vote request for `term`.
    ElectionResult { term: u64 },
    /// Leader announcing a new commit index.
    Commit {
        commit_index: u64,
        term: u64,
        reply: Reply,
    },
    Heartbeat { heartbeat: Heartbeat, reply: Reply },
    /// The in-flight catch-up request has returned.
    UpdateFinished,
    /// Stop the event loop.
    Shutdown,
}

impl Event {
    pub fn kind(&self) -> MessageKind {
        match self {
            Event::AppendEntry { .. } => MessageKind::AppendEntry,
            Event::ToLeader { .. } => MessageKind::ToLeader,
            Event::UpdateEntry { .. } => MessageKind::UpdateEntry,
            Event::CatchUpRequest { .. } => MessageKind::CatchUpRequest,
            Event::VoteRequest { .. } => MessageKind::VoteRequest,
            Event::ElectionResult { .. } => MessageKind::ElectionResult,
            Event::Commit { .. } => MessageKind::Commit,
            Event::Heartbeat { .. } => MessageKind::Heartbeat,
            Event::UpdateFinished => MessageKind::UpdateFinished,
            Event::Shutdown => MessageKind::Shutdown,
        }
    }

    /// Take the reply handle out of the event, if it carries one.
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Event::AppendEntry { reply, .. }
            | Event::ToLeader { reply, .. }
            | Event::UpdateEntry { reply, .. }
            | Event::CatchUpRequest { reply, .. }
            | Event::VoteRequest { reply, .. }
            | Event::Commit { reply, .. }
            | Event::Heartbeat { reply, .. } => Some(reply),
            Event::ElectionResult { .. } | Event::UpdateFinished | Event::Shutdown => None,
        }
    }

    /// Reject the event with `err` if it expects a reply.
    pub fn reject(self, err: ClusterError) {
        if let Some(reply) = self.into_reply() {
            reply.err(err);
        }
    }
}
