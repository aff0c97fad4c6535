//! Cluster membership registry.
//!
//! Holds this node's address and the ordered list of its peers.  The peer
//! list excludes self, so a startable cluster (even peer count) always has
//! an odd total size and an unambiguous majority.

use crate::errors::{ClusterError, ClusterResult};

/// Minimum number of peers (excluding self) before the cluster may start.
pub const MIN_PEERS: usize = 2;

#[derive(Debug, Clone)]
pub struct Membership {
    self_address: String,
    peers: Vec<String>,
}

impl Membership {
    pub fn new(self_address: impl Into<String>) -> Self {
        Self {
            self_address: self_address.into(),
            peers: Vec::new(),
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.iter().any(|p| p == address)
    }

    /// Add `address` to the peer list.  Re-registering a known peer, or
    /// this node itself, is a no-op.  Returns whether the list changed.
    pub fn register_peer(&mut self, address: &str) -> bool {
        let address = address.trim();
        if address.is_empty() || address == self.self_address || self.contains(address) {
            return false;
        }
        self.peers.push(address.to_string());
        true
    }

    pub fn remove_peer(&mut self, address: &str) -> ClusterResult<()> {
        let before = self.peers.len();
        self.peers.retain(|p| p != address);
        if self.peers.len() == before {
            return Err(ClusterError::NotRegistered {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    pub fn is_startable(&self) -> ClusterResult<()> {
        let count = self.peers.len();
        if count < MIN_PEERS {
            return Err(ClusterError::InsufficientPeers { count });
        }
        if count % 2 != 0 {
            return Err(ClusterError::OddPeerCountRequired { count });
        }
        Ok(())
    }

    /// Acknowledgements (self included) needed for a quorum.
    pub fn majority(&self) -> usize {
        majority(self.peers.len())
    }
}

/// `⌊peers/2⌋ + 1`, where `peers` excludes this node.
pub fn majority(peer_count: usize) -> usize {
    peer_count / 2 + 1
}
