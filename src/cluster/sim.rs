//! In-process peer networks for tests.
//!
//! [`SimNetwork`] routes every [`PeerMessenger`] call straight into the
//! target node's ingress, with switches for partitions and dropped
//! AppendEntries.  [`RecordingMessenger`] talks to nobody and records
//! what a single node tried to send.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use super::message::{Entry, Heartbeat, LeaderHeader};
use super::messenger::{AppendRequest, PeerFuture, PeerMessenger};
use super::Cluster;
use crate::errors::{ClusterError, ClusterResult};

#[derive(Default)]
pub struct SimNetwork {
    nodes: Mutex<HashMap<String, Arc<Cluster>>>,
    /// Unordered address pairs that cannot reach each other.
    cut: Mutex<HashSet<(String, String)>>,
    /// AppendEntries still to drop, per target.
    drop_appends: Mutex<HashMap<String, usize>>,
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messenger(self: &Arc<Self>, from: &str) -> Arc<SimMessenger> {
        Arc::new(SimMessenger {
            from: from.to_string(),
            network: Arc::downgrade(self),
        })
    }

    pub fn add(&self, cluster: Arc<Cluster>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(cluster.self_address().to_string(), cluster);
    }

    fn node(&self, address: &str) -> Option<Arc<Cluster>> {
        self.nodes.lock().unwrap().get(address).cloned()
    }

    fn addresses(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    /// Cut every link between the two groups.
    pub fn partition(&self, left: &[String], right: &[String]) {
        let mut cut = self.cut.lock().unwrap();
        for a in left {
            for b in right {
                cut.insert(pair(a, b));
            }
        }
    }

    /// Cut `address` off from every other node.
    pub fn isolate(&self, address: &str) {
        let others: Vec<String> = self
            .addresses()
            .into_iter()
            .filter(|a| a != address)
            .collect();
        self.partition(&[address.to_string()], &others);
    }

    pub fn heal(&self) {
        self.cut.lock().unwrap().clear();
    }

    /// Lose the next AppendEntries sent to `target`.
    pub fn drop_next_append(&self, target: &str) {
        *self
            .drop_appends
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default() += 1;
    }

    fn take_drop(&self, target: &str) -> bool {
        let mut drops = self.drop_appends.lock().unwrap();
        match drops.get_mut(target) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        !self.cut.lock().unwrap().contains(&pair(from, to))
    }
}

pub struct SimMessenger {
    from: String,
    network: Weak<SimNetwork>,
}

fn unreachable(peer: &str, message: &str) -> ClusterError {
    ClusterError::Peer {
        peer: peer.to_string(),
        message: message.to_string(),
    }
}

impl SimMessenger {
    fn route(&self, to: &str) -> ClusterResult<(Arc<SimNetwork>, Arc<Cluster>)> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| unreachable(to, "network shut down"))?;
        if !network.reachable(&self.from, to) {
            return Err(unreachable(to, "partitioned"));
        }
        let node = network
            .node(to)
            .ok_or_else(|| unreachable(to, "unknown node"))?;
        Ok((network, node))
    }
}

impl PeerMessenger for SimMessenger {
    fn request_vote(&self, peer: &str, term: u64) -> PeerFuture<'_> {
        let target = self.route(peer);
        Box::pin(async move { target?.1.dispatcher().vote_request(term).await })
    }

    fn append_entry(&self, peer: &str, request: AppendRequest) -> PeerFuture<'_> {
        let target = self.route(peer);
        let peer = peer.to_string();
        Box::pin(async move {
            let (network, node) = target?;
            if network.take_drop(&peer) {
                return Err(unreachable(&peer, "append dropped"));
            }
            let header = LeaderHeader {
                term: request.term,
                leader: request.leader,
                leader_index: request.leader_index,
            };
            node.dispatcher().leader_append(header, request.entry).await
        })
    }

    fn forward_to_leader(&self, leader: &str, entry: Entry) -> PeerFuture<'_> {
        let target = self.route(leader);
        Box::pin(async move { target?.1.dispatcher().client_append(entry).await })
    }

    fn heartbeat(&self, peer: &str, heartbeat: Heartbeat) -> PeerFuture<'_> {
        let target = self.route(peer);
        Box::pin(async move { target?.1.accept_heartbeat(heartbeat).await })
    }

    fn commit(&self, peer: &str, commit_index: u64, term: u64) -> PeerFuture<'_> {
        let target = self.route(peer);
        Box::pin(async move { target?.1.dispatcher().commit(commit_index, term).await })
    }

    fn request_catch_up(&self, leader: &str, from_index: u64, origin: &str) -> PeerFuture<'_> {
        let target = self.route(leader);
        let origin = origin.to_string();
        Box::pin(async move {
            target?
                .1
                .dispatcher()
                .catch_up_request(from_index, origin)
                .await
        })
    }

    fn push_entry(&self, peer: &str, index: u64, entry: Entry) -> PeerFuture<'_> {
        let target = self.route(peer);
        Box::pin(async move { target?.1.dispatcher().update_entry(index, entry).await })
    }

    fn register(&self, target: &str, address: &str, handshake: bool) -> PeerFuture<'_> {
        let node = self.route(target);
        let address = address.to_string();
        Box::pin(async move {
            node?
                .1
                .handle_registration(&address, handshake, false)
                .await
        })
    }

    fn start_cluster(&self, target: &str) -> PeerFuture<'_> {
        let node = self.route(target);
        Box::pin(async move { node?.1.start(false).await })
    }
}

/// Messenger for single-node tests: every call fails as unreachable and
/// is recorded as a short string such as `catch_up:node-2:4`.
#[derive(Default)]
pub struct RecordingMessenger {
    calls: Mutex<Vec<String>>,
}

impl RecordingMessenger {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String, peer: &str) -> PeerFuture<'_> {
        self.calls.lock().unwrap().push(call);
        let err = unreachable(peer, "recording only");
        Box::pin(async move { Err(err) })
    }
}

impl PeerMessenger for RecordingMessenger {
    fn request_vote(&self, peer: &str, term: u64) -> PeerFuture<'_> {
        self.record(format!("vote:{peer}:{term}"), peer)
    }

    fn append_entry(&self, peer: &str, request: AppendRequest) -> PeerFuture<'_> {
        self.record(format!("append:{peer}:{}", request.leader_index), peer)
    }

    fn forward_to_leader(&self, leader: &str, entry: Entry) -> PeerFuture<'_> {
        self.record(format!("forward:{leader}:{}", entry.key), leader)
    }

    fn heartbeat(&self, peer: &str, heartbeat: Heartbeat) -> PeerFuture<'_> {
        self.record(format!("heartbeat:{peer}:{}", heartbeat.term), peer)
    }

    fn commit(&self, peer: &str, commit_index: u64, _term: u64) -> PeerFuture<'_> {
        self.record(format!("commit:{peer}:{commit_index}"), peer)
    }

    fn request_catch_up(&self, leader: &str, from_index: u64, _origin: &str) -> PeerFuture<'_> {
        self.record(format!("catch_up:{leader}:{from_index}"), leader)
    }

    fn push_entry(&self, peer: &str, index: u64, _entry: Entry) -> PeerFuture<'_> {
        self.record(format!("push:{peer}:{index}"), peer)
    }

    fn register(&self, target: &str, address: &str, handshake: bool) -> PeerFuture<'_> {
        self.record(format!("register:{target}:{address}:{handshake}"), target)
    }

    fn start_cluster(&self, target: &str) -> PeerFuture<'_> {
        self.record(format!("start:{target}"), target)
    }
}
