//! Candidate role loop.
//!
//! Each round bumps the term, votes for itself and asks every peer for a
//! vote.  Grants come back as `ElectionResult` self-messages.  A round
//! that ends without a majority restarts with a jittered timeout.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::follower;
use super::message::{Event, Heartbeat, Role};
use super::replication;
use super::state::Shared;
use crate::errors::ClusterError;
use crate::metrics;

pub async fn run(shared: &Arc<Shared>, inbox: &mut mpsc::Receiver<Event>) -> Role {
    let mut votes = start_round(shared);
    let mut deadline = Instant::now() + shared.timing.election_round();
    loop {
        if votes >= shared.majority() {
            announce_win(shared);
            return Role::Leader;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!(term = shared.term(), votes, "election round timed out, restarting");
                votes = start_round(shared);
                deadline = Instant::now() + shared.timing.election_restart();
            }
            event = inbox.recv() => {
                let Some(event) = event else {
                    return Role::Stopped;
                };
                match event {
                    Event::ElectionResult { term } => {
                        if term >= shared.term() {
                            votes += 1;
                            debug!(term, votes, "vote received");
                        }
                    }
                    Event::VoteRequest { term, reply } => {
                        if follower::grant_vote(shared, term, reply) {
                            return Role::Follower;
                        }
                    }
                    Event::Heartbeat { heartbeat, reply } => {
                        if heartbeat.term >= shared.term() && !shared.is_self(&heartbeat.leader) {
                            follower::accept_heartbeat(shared, heartbeat, reply);
                            return Role::Follower;
                        }
                        reply.err(ClusterError::StaleTerm {
                            local: shared.term(),
                            received: heartbeat.term,
                        });
                    }
                    Event::UpdateFinished => shared.finish_catch_up(),
                    Event::Shutdown => return Role::Stopped,
                    other => other.reject(ClusterError::ElectionInProgress),
                }
            }
        }
    }
}

/// Start a new round and return the initial vote count (our own vote).
fn start_round(shared: &Arc<Shared>) -> usize {
    let term = shared.with_meta(|meta| {
        meta.term = meta.term.saturating_add(1);
        meta.leader.clear();
        meta.term
    });
    metrics::record_election("started");
    info!(term, "starting election");

    for peer in shared.peers() {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            match shared.messenger.request_vote(&peer, term).await {
                Ok(()) => shared.notify(Event::ElectionResult { term }).await,
                Err(err) => debug!(%peer, term, error = %err, "vote not granted"),
            }
        });
    }
    1
}

fn announce_win(shared: &Arc<Shared>) {
    let address = shared.self_address.clone();
    let heartbeat = shared.with_meta(|meta| {
        meta.role = Role::Leader;
        meta.leader = address.clone();
        Heartbeat {
            term: meta.term,
            leader: address,
            leader_index: meta.log_index,
            commit_index: meta.commit_index,
        }
    });
    metrics::record_election("won");
    info!(term = heartbeat.term, "won election");
    replication::broadcast_heartbeat(shared, heartbeat);
}
