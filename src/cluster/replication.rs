//! Replication workers.
//!
//! Everything here runs outside the role loops: the majority fan-out the
//! leader awaits, fire-and-forget heartbeat/commit broadcasts, the commit
//! application walks, and both ends of catch-up.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::membership::majority;
use super::message::{Entry, Event, Heartbeat};
use super::messenger::AppendRequest;
use super::state::Shared;
use crate::errors::{ClusterError, ClusterResult};
use crate::metrics;

/// Send `request` to every peer and wait until a majority (self included)
/// has acknowledged it.
///
/// Fails with `QuorumNotReached` once enough peers have failed that a
/// majority is out of reach, or when the quorum timeout expires.  Appends
/// still in flight keep running after this returns.
pub async fn broadcast_append(shared: &Shared, request: AppendRequest) -> ClusterResult<usize> {
    let peers = shared.peers();
    let needed = majority(peers.len());
    let mut acks = 1;
    if acks >= needed {
        return Ok(acks);
    }

    let mut pending = JoinSet::new();
    for peer in peers.iter().cloned() {
        let messenger = Arc::clone(&shared.messenger);
        let request = request.clone();
        pending.spawn(async move {
            let result = messenger.append_entry(&peer, request).await;
            (peer, result)
        });
    }

    let deadline = tokio::time::sleep(shared.timing.quorum_timeout());
    tokio::pin!(deadline);
    let mut failures = 0;
    let outcome = loop {
        tokio::select! {
            joined = pending.join_next() => {
                match joined {
                    Some(Ok((_, Ok(())))) => {
                        acks += 1;
                        if acks >= needed {
                            break Ok(acks);
                        }
                    }
                    Some(Ok((peer, Err(err)))) => {
                        debug!(%peer, index = request.leader_index, error = %err, "append rejected");
                        failures += 1;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "append task failed");
                        failures += 1;
                    }
                    None => break Err(ClusterError::QuorumNotReached { acks, majority: needed }),
                }
                if 1 + peers.len() - failures < needed {
                    break Err(ClusterError::QuorumNotReached { acks, majority: needed });
                }
            }
            _ = &mut deadline => {
                break Err(ClusterError::QuorumNotReached { acks, majority: needed });
            }
        }
    };
    pending.detach_all();

    match &outcome {
        Ok(_) => metrics::record_replication("committed"),
        Err(_) => metrics::record_replication("quorum_not_reached"),
    }
    outcome
}

/// Fire-and-forget heartbeat to every peer.
pub fn broadcast_heartbeat(shared: &Shared, heartbeat: Heartbeat) {
    for peer in shared.peers() {
        let messenger = Arc::clone(&shared.messenger);
        let heartbeat = heartbeat.clone();
        tokio::spawn(async move {
            if let Err(err) = messenger.heartbeat(&peer, heartbeat).await {
                debug!(%peer, error = %err, "heartbeat not delivered");
            }
        });
    }
}

/// Fire-and-forget commit announcement to every peer.
pub fn broadcast_commit(shared: &Shared, commit_index: u64, term: u64) {
    for peer in shared.peers() {
        let messenger = Arc::clone(&shared.messenger);
        tokio::spawn(async move {
            if let Err(err) = messenger.commit(&peer, commit_index, term).await {
                debug!(%peer, commit_index, error = %err, "commit not delivered");
            }
        });
    }
}

async fn apply_entry(shared: &Shared, index: u64, entry: &Entry) {
    match shared.store.apply(&entry.key, &entry.value).await {
        Ok(()) => {
            metrics::record_apply("ok");
            debug!(index, key = %entry.key, "entry applied");
        }
        Err(err) => {
            metrics::record_apply("error");
            warn!(index, key = %entry.key, error = %err, "storage apply failed");
        }
    }
}

/// Leader side: apply everything after the applied index up to `target`.
///
/// Walks are serialized by the WAL lock and resume from the applied index,
/// so storage sees entries in index order however the calls interleave.
pub async fn apply_committed(shared: &Shared, target: u64) {
    let wal = shared.wal.lock().await;
    let from = shared.snapshot().applied_index.saturating_add(1);
    for index in from..=target {
        match wal.get(index) {
            Some(entry) => apply_entry(shared, index, entry).await,
            None => warn!(index, "committed index has no WAL entry, skipping"),
        }
        shared.with_meta(|meta| meta.applied_index = meta.applied_index.max(index));
    }
}

/// Follower side: apply and commit entries after the commit index up to
/// `target`, stopping at the first hole.
pub async fn commit_walk(shared: &Shared, target: u64) -> ClusterResult<()> {
    let wal = shared.wal.lock().await;
    let from = shared.snapshot().commit_index.saturating_add(1);
    for index in from..=target {
        let Some(entry) = wal.get(index) else {
            return Err(ClusterError::WalHole { index });
        };
        apply_entry(shared, index, entry).await;
        shared.with_meta(|meta| {
            meta.commit_index = meta.commit_index.max(index);
            meta.applied_index = meta.applied_index.max(index);
        });
    }
    Ok(())
}

/// Follower side: ask the leader for every entry after `from_index`.
///
/// At most one request is in flight; returns `false` if one already is.
/// The worker always reports `UpdateFinished` back to the event loop when
/// the request returns, so the next trigger can retry a failed attempt.
pub fn start_catch_up(shared: &Arc<Shared>, from_index: u64) -> bool {
    let leader = shared.leader();
    if leader.is_empty() || shared.is_self(&leader) {
        return false;
    }
    if !shared.try_begin_catch_up() {
        return false;
    }
    metrics::record_catch_up("requested");
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        info!(from_index, %leader, "requesting catch-up");
        let origin = shared.self_address.clone();
        match shared
            .messenger
            .request_catch_up(&leader, from_index, &origin)
            .await
        {
            Ok(()) => info!(from_index, %leader, "catch-up finished"),
            Err(err) => warn!(from_index, %leader, error = %err, "catch-up failed"),
        }
        shared.notify(Event::UpdateFinished).await;
    });
    true
}

/// Leader side: push every entry in `from_index+1 ..= log_index` to
/// `origin`, one at a time, in order.
///
/// The entries are copied out under the WAL lock and pushed after it is
/// released.  Writes landing after the copy reach the follower through
/// regular appends or the next catch-up.
pub async fn stream_catch_up(shared: &Shared, from_index: u64, origin: &str) -> ClusterResult<()> {
    metrics::record_catch_up("served");
    let Some(first) = from_index.checked_add(1) else {
        return Ok(());
    };
    let entries: Vec<(u64, Entry)> = {
        let wal = shared.wal.lock().await;
        let last = shared.snapshot().log_index;
        (first..=last)
            .filter_map(|index| wal.get(index).map(|entry| (index, entry.clone())))
            .collect()
    };
    info!(%origin, from_index, count = entries.len(), "streaming catch-up entries");
    for (index, entry) in entries {
        shared.messenger.push_entry(origin, index, entry).await?;
    }
    Ok(())
}
