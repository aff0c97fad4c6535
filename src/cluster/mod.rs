//! Replication layer.
//!
//! A small cluster of nodes agrees on a leader and on the ordered
//! sequence of key/value writes, and applies committed writes to the
//! storage layer.  [`Cluster`] is the facade the HTTP layer and the binary
//! use: it owns the node's shared state, starts and stops its event loop
//! and handles membership.

pub mod candidate;
pub mod dispatcher;
pub mod follower;
pub mod leader;
pub mod membership;
pub mod message;
pub mod messenger;
pub mod node;
pub mod replication;
pub mod state;
pub mod wal;

#[cfg(test)]
pub(crate) mod sim;
#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use self::dispatcher::Dispatcher;
use self::membership::Membership;
use self::message::{Entry, Event, Heartbeat, Role};
use self::messenger::{HttpMessenger, PeerMessenger};
use self::node::InboxSlot;
use self::state::{NodeStatus, Shared, Timing};
use crate::config::ClusterConfig;
use crate::errors::{ClusterError, ClusterResult};
use crate::storage::backend::KvStore;

/// Capacity of the event channel.  One slot keeps senders in lockstep with
/// the loop consuming events.
const EVENT_CHANNEL_CAPACITY: usize = 1;

pub struct Cluster {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    /// Event receiver, present while the loop is not running.
    inbox: InboxSlot,
}

impl Cluster {
    pub fn new(
        self_address: &str,
        peers: &[String],
        timing: Timing,
        messenger: Arc<dyn PeerMessenger>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let mut membership = Membership::new(self_address);
        for peer in peers {
            membership.register_peer(peer);
        }
        let (events, inbox) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::new(membership, timing, events, messenger, store));
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&shared)),
            shared,
            inbox: Arc::new(Mutex::new(Some(inbox))),
        }
    }

    /// Build a node that talks to its peers over HTTP.
    pub fn from_config(
        config: &ClusterConfig,
        self_address: &str,
        store: Arc<dyn KvStore>,
    ) -> anyhow::Result<Self> {
        let messenger = HttpMessenger::new(config.peer_timeout(), config.internal_token.clone())?;
        Ok(Self::new(
            self_address,
            &config.peers,
            Timing::from_config(config),
            Arc::new(messenger),
            store,
        ))
    }

    pub fn self_address(&self) -> &str {
        &self.shared.self_address
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.shared.store
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.status()
    }

    pub fn peers(&self) -> Vec<String> {
        self.shared.peers()
    }

    /// The known leader, if any.
    pub fn leader(&self) -> Option<String> {
        let leader = self.shared.leader();
        (!leader.is_empty()).then_some(leader)
    }

    pub fn is_running(&self) -> bool {
        self.shared.role() != Role::Stopped
    }

    pub fn register_peer(&self, address: &str) -> bool {
        let added = self
            .shared
            .membership
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register_peer(address);
        if added {
            info!(peer = %address, "peer registered");
        }
        added
    }

    pub fn remove_peer(&self, address: &str) -> ClusterResult<()> {
        self.shared
            .membership
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove_peer(address)?;
        info!(peer = %address, "peer removed");
        Ok(())
    }

    pub fn is_startable(&self) -> ClusterResult<()> {
        self.shared
            .membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_startable()
    }

    fn is_registered(&self, address: &str) -> bool {
        self.shared
            .membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
    }

    /// Start the event loop after checking startability.  The start point
    /// also tells every peer to start.
    pub async fn start(&self, is_start_point: bool) -> ClusterResult<()> {
        self.is_startable()?;
        self.launch();
        if is_start_point {
            for peer in self.peers() {
                if let Err(err) = self.shared.messenger.start_cluster(&peer).await {
                    warn!(%peer, error = %err, "peer did not start");
                }
            }
        }
        Ok(())
    }

    /// Spawn the driver unless it is already running.
    fn launch(&self) -> bool {
        let inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(inbox) = inbox else {
            return false;
        };
        // Accept events as soon as `launch` returns.
        self.shared.set_role(Role::Follower);
        let shared = Arc::clone(&self.shared);
        let slot = Arc::clone(&self.inbox);
        tokio::spawn(node::run(shared, inbox, slot));
        true
    }

    /// Ask the event loop to stop.
    pub async fn stop(&self) -> ClusterResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.shared
            .events
            .send(Event::Shutdown)
            .await
            .map_err(|_| ClusterError::NotRunning)
    }

    /// Bring `address` into the cluster from this (entry-point) node.
    ///
    /// Every known peer is told to register the newcomer and register
    /// itself back with it; then this node registers itself with the
    /// newcomer.  The first communication failure aborts the join.
    pub async fn join(&self, address: &str) -> ClusterResult<()> {
        if address.is_empty() {
            return Err(ClusterError::invalid("address must not be empty"));
        }
        if self.is_registered(address) || address == self.self_address() {
            return Err(ClusterError::AlreadyRegistered {
                address: address.to_string(),
            });
        }
        for peer in self.peers() {
            self.shared.messenger.register(&peer, address, true).await?;
        }
        self.shared
            .messenger
            .register(address, self.self_address(), false)
            .await?;
        self.register_peer(address);
        info!(peer = %address, "node joined");
        Ok(())
    }

    /// Handle an inbound registration request.
    pub async fn handle_registration(
        &self,
        address: &str,
        handshake: bool,
        start_point: bool,
    ) -> ClusterResult<()> {
        if start_point {
            return self.join(address).await;
        }
        if address.is_empty() {
            return Err(ClusterError::invalid("address must not be empty"));
        }
        if handshake {
            self.shared
                .messenger
                .register(address, self.self_address(), false)
                .await?;
        }
        self.register_peer(address);
        Ok(())
    }

    /// Heartbeat ingress.  A stopped node that can form a quorum starts
    /// its event loop on the first heartbeat it sees.
    pub async fn accept_heartbeat(&self, heartbeat: Heartbeat) -> ClusterResult<()> {
        if !self.is_running() {
            self.is_startable().map_err(|_| ClusterError::NotRunning)?;
            if self.launch() {
                info!(leader = %heartbeat.leader, "started by heartbeat");
            }
        }
        self.dispatcher.heartbeat(heartbeat).await
    }

    /// Wait until a leader is known.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<String> {
        let mut rx = self.shared.leader_watch();
        let result =
            match tokio::time::timeout(timeout, rx.wait_for(|leader| !leader.is_empty())).await {
                Ok(Ok(leader)) => Ok((*leader).clone()),
                Ok(Err(_)) => Err(ClusterError::NotRunning),
                Err(_) => Err(ClusterError::NoLeader),
            };
        result
    }

    /// Client write entry point: waits for a leader, then appends locally
    /// on the leader or forwards from anywhere else.
    pub async fn submit_write(&self, entry: Entry) -> ClusterResult<()> {
        if !entry.is_filled() {
            return Err(ClusterError::invalid("entry key must not be empty"));
        }
        if !self.is_running() {
            return Err(ClusterError::NotRunning);
        }
        self.wait_for_leader(self.shared.timing.leader_wait).await?;
        if self.shared.role() == Role::Leader {
            self.dispatcher.client_append(entry).await
        } else {
            self.dispatcher.to_leader(entry).await
        }
    }

    /// Filled WAL entries, in index order.
    pub async fn wal_entries(&self) -> Vec<(u64, Entry)> {
        let wal = self.shared.wal.lock().await;
        wal.iter().map(|(index, entry)| (index, entry.clone())).collect()
    }
}
