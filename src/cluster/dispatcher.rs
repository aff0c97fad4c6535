//! Ingress adapter.
//!
//! Each method wraps an inbound request into an [`Event`], hands it to the
//! running role loop over the node's event channel and awaits the reply.
//! HTTP handlers and the in-process test network both enter through here.

use std::sync::Arc;

use super::message::{Entry, EntryOrigin, Event, Heartbeat, LeaderHeader, Reply, Role};
use super::state::Shared;
use crate::errors::{ClusterError, ClusterResult};

#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    async fn dispatch(&self, make: impl FnOnce(Reply) -> Event) -> ClusterResult<()> {
        if self.shared.role() == Role::Stopped {
            return Err(ClusterError::NotRunning);
        }
        let (reply, rx) = Reply::channel();
        let event = make(reply);
        let kind = event.kind();
        if self.shared.events.send(event).await.is_err() {
            return Err(ClusterError::NotRunning);
        }
        let result = rx.await.unwrap_or(Err(ClusterError::NoReply));
        if let Err(err) = &result {
            tracing::debug!(%kind, error = %err, "request rejected");
        }
        result
    }

    /// A client write: accepted on the leader, `NotLeader` elsewhere.
    pub async fn client_append(&self, entry: Entry) -> ClusterResult<()> {
        self.dispatch(|reply| Event::AppendEntry {
            entry,
            origin: EntryOrigin::Client,
            reply,
        })
        .await
    }

    /// Replication from the leader.
    pub async fn leader_append(&self, header: LeaderHeader, entry: Entry) -> ClusterResult<()> {
        self.dispatch(|reply| Event::AppendEntry {
            entry,
            origin: EntryOrigin::Leader(header),
            reply,
        })
        .await
    }

    /// A client write that should reach the leader from wherever it entered.
    pub async fn to_leader(&self, entry: Entry) -> ClusterResult<()> {
        self.dispatch(|reply| Event::ToLeader { entry, reply }).await
    }

    pub async fn update_entry(&self, index: u64, entry: Entry) -> ClusterResult<()> {
        self.dispatch(|reply| Event::UpdateEntry {
            index,
            entry,
            reply,
        })
        .await
    }

    pub async fn catch_up_request(&self, from_index: u64, origin: String) -> ClusterResult<()> {
        self.dispatch(|reply| Event::CatchUpRequest {
            from_index,
            origin,
            reply,
        })
        .await
    }

    pub async fn vote_request(&self, term: u64) -> ClusterResult<()> {
        self.dispatch(|reply| Event::VoteRequest { term, reply }).await
    }

    pub async fn commit(&self, commit_index: u64, term: u64) -> ClusterResult<()> {
        self.dispatch(|reply| Event::Commit {
            commit_index,
            term,
            reply,
        })
        .await
    }

    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> ClusterResult<()> {
        self.dispatch(|reply| Event::Heartbeat { heartbeat, reply })
            .await
    }
}
