//! Leader role loop.
//!
//! The leader sends periodic heartbeats, serializes client writes through
//! the majority fan-out, streams catch-up entries to lagging followers and
//! steps down on any message carrying a newer term.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::follower;
use super::message::{Entry, EntryOrigin, Event, Heartbeat, MessageKind, Role};
use super::messenger::AppendRequest;
use super::replication;
use super::state::Shared;
use crate::errors::{ClusterError, ClusterResult};

pub async fn run(shared: &Arc<Shared>, inbox: &mut mpsc::Receiver<Event>) -> Role {
    let mut ticker = tokio::time::interval(shared.timing.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                replication::broadcast_heartbeat(shared, current_heartbeat(shared));
            }
            event = inbox.recv() => {
                let Some(event) = event else {
                    return Role::Stopped;
                };
                if let Some(next) = handle(shared, event).await {
                    return next;
                }
            }
        }
    }
}

fn current_heartbeat(shared: &Shared) -> Heartbeat {
    let meta = shared.snapshot();
    Heartbeat {
        term: meta.term,
        leader: shared.self_address.clone(),
        leader_index: meta.log_index,
        commit_index: meta.commit_index,
    }
}

/// Handle one event.  Returns the next role when the leader steps down.
async fn handle(shared: &Arc<Shared>, event: Event) -> Option<Role> {
    match event {
        Event::AppendEntry {
            entry,
            origin: EntryOrigin::Client,
            reply,
        }
        | Event::ToLeader { entry, reply } => {
            reply.send(client_write(shared, entry).await);
            None
        }
        Event::AppendEntry {
            entry,
            origin: EntryOrigin::Leader(header),
            reply,
        } => {
            if header.term > shared.term() {
                info!(term = header.term, leader = %header.leader, "newer leader, stepping down");
                shared.set_role(Role::Follower);
                follower::accept_append(shared, header, entry, reply);
                return Some(Role::Follower);
            }
            reply.err(ClusterError::StaleTerm {
                local: shared.term(),
                received: header.term,
            });
            None
        }
        Event::Commit {
            commit_index,
            term,
            reply,
        } => {
            if term > shared.term() {
                info!(term, "commit from newer term, stepping down");
                shared.set_role(Role::Follower);
                follower::accept_commit(shared, commit_index, term, reply);
                return Some(Role::Follower);
            }
            reply.err(ClusterError::StaleTerm {
                local: shared.term(),
                received: term,
            });
            None
        }
        Event::Heartbeat { heartbeat, reply } => {
            if heartbeat.term > shared.term() {
                info!(term = heartbeat.term, leader = %heartbeat.leader, "newer leader, stepping down");
                shared.set_role(Role::Follower);
                follower::accept_heartbeat(shared, heartbeat, reply);
                return Some(Role::Follower);
            }
            reply.err(ClusterError::StaleTerm {
                local: shared.term(),
                received: heartbeat.term,
            });
            None
        }
        Event::VoteRequest { term, reply } => {
            if follower::grant_vote(shared, term, reply) {
                info!(term, "granted vote for newer term, stepping down");
                return Some(Role::Follower);
            }
            None
        }
        Event::CatchUpRequest {
            from_index,
            origin,
            reply,
        } => {
            let log_index = shared.snapshot().log_index;
            if from_index >= log_index {
                reply.err(ClusterError::LeaderBehind {
                    local_index: from_index,
                    leader_index: log_index,
                });
                return None;
            }
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                let result = replication::stream_catch_up(&shared, from_index, &origin).await;
                if let Err(err) = &result {
                    warn!(%origin, from_index, error = %err, "catch-up stream aborted");
                }
                reply.send(result);
            });
            None
        }
        Event::UpdateEntry { reply, .. } => {
            reply.err(ClusterError::UnexpectedMessage {
                role: Role::Leader,
                kind: MessageKind::UpdateEntry,
            });
            None
        }
        Event::ElectionResult { term } => {
            debug!(term, "late vote ignored");
            None
        }
        Event::UpdateFinished => {
            shared.finish_catch_up();
            None
        }
        Event::Shutdown => Some(Role::Stopped),
    }
}

/// Append a client write, replicate it to a majority, then commit and
/// apply it.
async fn client_write(shared: &Arc<Shared>, entry: Entry) -> ClusterResult<()> {
    if !entry.is_filled() {
        return Err(ClusterError::invalid("entry key must not be empty"));
    }

    let (term, index) = {
        let mut wal = shared.wal.lock().await;
        let (term, index) = shared
            .with_meta(|meta| {
                meta.log_index = meta.log_index.checked_add(1)?;
                Some((meta.term, meta.log_index))
            })
            .ok_or_else(|| ClusterError::invalid("log index exhausted"))?;
        wal.write_at(index, entry.clone())?;
        (term, index)
    };

    let request = AppendRequest {
        term,
        leader: shared.self_address.clone(),
        leader_index: index,
        entry,
    };
    match replication::broadcast_append(shared, request).await {
        Ok(acks) => {
            shared.with_meta(|meta| meta.commit_index = meta.commit_index.max(index));
            info!(index, acks, term, "entry committed");
            replication::broadcast_commit(shared, index, term);
            let shared = Arc::clone(shared);
            tokio::spawn(async move { replication::apply_committed(&shared, index).await });
            Ok(())
        }
        Err(err) => {
            warn!(index, term, error = %err, "entry not committed");
            Err(err)
        }
    }
}
