//! Follower role loop.
//!
//! A follower accepts replication from the leader, forwards client writes
//! to it and becomes a candidate when no valid leader contact arrives
//! within a randomized election timeout.
//!
//! The `accept_*` handlers are also used by the candidate and leader loops
//! when a message from a newer term demotes them: the demoted node adopts
//! the term and then handles the message exactly as a follower would.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::{Entry, EntryOrigin, Event, Heartbeat, LeaderHeader, Reply, Role};
use super::replication;
use super::state::Shared;
use super::wal::WriteAheadLog;
use crate::errors::ClusterError;

pub async fn run(shared: &Arc<Shared>, inbox: &mut mpsc::Receiver<Event>) -> Role {
    let mut deadline = Instant::now() + shared.timing.random_election_timeout();
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!(term = shared.term(), "election timeout, no leader contact");
                return Role::Candidate;
            }
            event = inbox.recv() => {
                let Some(event) = event else {
                    return Role::Stopped;
                };
                match handle(shared, event) {
                    Step::Stay => {}
                    Step::ResetTimer => {
                        deadline = Instant::now() + shared.timing.random_election_timeout();
                    }
                    Step::Become(role) => return role,
                }
            }
        }
    }
}

enum Step {
    Stay,
    /// Valid leader contact or a granted vote.
    ResetTimer,
    Become(Role),
}

fn handle(shared: &Arc<Shared>, event: Event) -> Step {
    match event {
        Event::AppendEntry {
            entry,
            origin: EntryOrigin::Leader(header),
            reply,
        } => contact(accept_append(shared, header, entry, reply)),
        Event::AppendEntry {
            origin: EntryOrigin::Client,
            reply,
            ..
        } => {
            reply.err(ClusterError::NotLeader {
                leader: shared.leader(),
            });
            Step::Stay
        }
        Event::ToLeader { entry, reply } => {
            forward_to_leader(shared, entry, reply);
            Step::Stay
        }
        Event::UpdateEntry {
            index,
            entry,
            reply,
        } => {
            accept_update(shared, index, entry, reply);
            Step::Stay
        }
        Event::CatchUpRequest { reply, .. } => {
            reply.err(ClusterError::NotLeader {
                leader: shared.leader(),
            });
            Step::Stay
        }
        Event::VoteRequest { term, reply } => contact(grant_vote(shared, term, reply)),
        Event::Commit {
            commit_index,
            term,
            reply,
        } => {
            accept_commit(shared, commit_index, term, reply);
            Step::Stay
        }
        Event::Heartbeat { heartbeat, reply } => {
            contact(accept_heartbeat(shared, heartbeat, reply))
        }
        Event::ElectionResult { term } => {
            debug!(term, "late vote ignored");
            Step::Stay
        }
        Event::UpdateFinished => {
            shared.finish_catch_up();
            Step::Stay
        }
        Event::Shutdown => Step::Become(Role::Stopped),
    }
}

fn contact(valid: bool) -> Step {
    if valid {
        Step::ResetTimer
    } else {
        Step::Stay
    }
}

enum AppendDecision {
    Accept,
    Gap { local_index: u64 },
    Behind { local_index: u64 },
}

/// Handle one replicated entry.  Returns whether the sender was a valid
/// leader for the current term.
pub(super) fn accept_append(
    shared: &Arc<Shared>,
    header: LeaderHeader,
    entry: Entry,
    reply: Reply,
) -> bool {
    let decision = shared.with_meta(|meta| {
        if header.term < meta.term {
            return Err(ClusterError::StaleTerm {
                local: meta.term,
                received: header.term,
            });
        }
        meta.term = header.term;
        meta.leader = header.leader.clone();
        meta.leader_index = meta.leader_index.max(header.leader_index);
        match header.leader_index.checked_sub(meta.log_index) {
            Some(1) => {
                // Claim the slot now so the next append sees it.
                meta.log_index = header.leader_index;
                Ok(AppendDecision::Accept)
            }
            Some(0) | None => Ok(AppendDecision::Behind {
                local_index: meta.log_index,
            }),
            Some(_) => Ok(AppendDecision::Gap {
                local_index: meta.log_index,
            }),
        }
    });

    match decision {
        Err(err) => {
            reply.err(err);
            false
        }
        Ok(AppendDecision::Accept) => {
            let shared = Arc::clone(shared);
            let index = header.leader_index;
            tokio::spawn(async move {
                let result = shared.wal.lock().await.write_at(index, entry);
                debug!(index, "replicated entry written");
                reply.send(result);
            });
            true
        }
        Ok(AppendDecision::Gap { local_index }) => {
            reply.err(ClusterError::StaleFollower {
                local_index,
                leader_index: header.leader_index,
            });
            replication::start_catch_up(shared, local_index);
            true
        }
        Ok(AppendDecision::Behind { local_index }) => {
            reply.err(ClusterError::LeaderBehind {
                local_index,
                leader_index: header.leader_index,
            });
            true
        }
    }
}

/// Handle a heartbeat.  Returns whether it came from a valid leader.
pub(super) fn accept_heartbeat(shared: &Arc<Shared>, heartbeat: Heartbeat, reply: Reply) -> bool {
    let decision = shared.with_meta(|meta| {
        if heartbeat.term < meta.term {
            return Err(ClusterError::StaleTerm {
                local: meta.term,
                received: heartbeat.term,
            });
        }
        meta.term = heartbeat.term;
        meta.leader = heartbeat.leader.clone();
        meta.leader_index = meta.leader_index.max(heartbeat.leader_index);
        Ok((meta.log_index, meta.commit_index))
    });

    let (log_index, commit_index) = match decision {
        Ok(indices) => indices,
        Err(err) => {
            reply.err(err);
            return false;
        }
    };

    if heartbeat.leader_index > log_index {
        replication::start_catch_up(shared, log_index);
    } else if heartbeat.commit_index > commit_index {
        spawn_commit(shared, heartbeat.commit_index.min(log_index), None);
    }
    reply.ok();
    true
}

/// Grant the vote if `term` is newer than ours.  Returns whether it was
/// granted.
pub(super) fn grant_vote(shared: &Arc<Shared>, term: u64, reply: Reply) -> bool {
    let result = shared.with_meta(|meta| {
        if term > meta.term {
            meta.term = term;
            meta.leader.clear();
            Ok(())
        } else {
            Err(ClusterError::StaleTerm {
                local: meta.term,
                received: term,
            })
        }
    });
    let granted = result.is_ok();
    if granted {
        info!(term, "vote granted");
    }
    reply.send(result);
    granted
}

enum CommitDecision {
    Nothing,
    Walk,
    Missing { log_index: u64 },
}

pub(super) fn accept_commit(shared: &Arc<Shared>, commit_index: u64, term: u64, reply: Reply) {
    let decision = shared.with_meta(|meta| {
        if term < meta.term {
            return Err(ClusterError::StaleTerm {
                local: meta.term,
                received: term,
            });
        }
        meta.term = term;
        if meta.leader.is_empty() || commit_index <= meta.commit_index {
            Ok(CommitDecision::Nothing)
        } else if commit_index > meta.log_index {
            Ok(CommitDecision::Missing {
                log_index: meta.log_index,
            })
        } else {
            Ok(CommitDecision::Walk)
        }
    });

    match decision {
        Err(err) => reply.err(err),
        Ok(CommitDecision::Nothing) => reply.ok(),
        Ok(CommitDecision::Missing { log_index }) => {
            reply.err(ClusterError::NotUpToDate {
                commit_index,
                log_index,
            });
            replication::start_catch_up(shared, log_index);
        }
        Ok(CommitDecision::Walk) => spawn_commit(shared, commit_index, Some(reply)),
    }
}

/// Run a commit walk up to `target` in a worker.  A walk already running
/// makes this a no-op; the next heartbeat retriggers it.
fn spawn_commit(shared: &Arc<Shared>, target: u64, reply: Option<Reply>) {
    let began = shared.with_meta(|meta| {
        if meta.applying {
            false
        } else {
            meta.applying = true;
            true
        }
    });
    if !began {
        if let Some(reply) = reply {
            reply.ok();
        }
        return;
    }

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let result = replication::commit_walk(&shared, target).await;
        shared.with_meta(|meta| meta.applying = false);
        if let Err(ClusterError::WalHole { index }) = &result {
            warn!(index, target, "hole in write-ahead log, requesting catch-up");
            replication::start_catch_up(&shared, index.saturating_sub(1));
        }
        match reply {
            Some(reply) => reply.send(result),
            None => {
                if let Err(err) = result {
                    debug!(target, error = %err, "commit walk stopped early");
                }
            }
        }
    });
}

/// Write a catch-up entry at its explicit index.  The index must not pass
/// the highest index a leader has advertised.
fn accept_update(shared: &Arc<Shared>, index: u64, entry: Entry, reply: Reply) {
    if index == 0 {
        reply.err(ClusterError::invalid("index 0 is reserved"));
        return;
    }
    if !WriteAheadLog::addressable(index) {
        reply.err(ClusterError::invalid(format!("log index {index} out of range")));
        return;
    }
    let claimed = shared.with_meta(|meta| {
        if index > meta.leader_index {
            return Err(ClusterError::invalid(format!(
                "log index {index} is past the advertised leader index {}",
                meta.leader_index
            )));
        }
        meta.log_index = meta.log_index.max(index);
        Ok(())
    });
    if let Err(err) = claimed {
        reply.err(err);
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let result = shared.wal.lock().await.write_at(index, entry);
        debug!(index, "catch-up entry written");
        reply.send(result);
    });
}

fn forward_to_leader(shared: &Arc<Shared>, entry: Entry, reply: Reply) {
    let leader = shared.leader();
    if leader.is_empty() {
        reply.err(ClusterError::NoLeader);
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        debug!(%leader, key = %entry.key, "forwarding write to leader");
        let result = shared.messenger.forward_to_leader(&leader, entry).await;
        reply.send(result);
    });
}
