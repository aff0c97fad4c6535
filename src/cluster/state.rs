//! Shared node state.
//!
//! [`Shared`] is the one explicit state object of a node.  The role loops
//! own protocol transitions; spawned workers (writes, commit walks,
//! catch-up, fan-outs) read and update the same state through it.
//!
//! Locking rules:
//! - `meta` is a `std::sync::Mutex` and is never held across `.await`.
//! - `wal` is a `tokio::sync::Mutex` and may be held across storage and
//!   network awaits.  When both are needed, take `wal` first.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use utoipa::ToSchema;

use super::membership::Membership;
use super::message::{Event, Role};
use super::messenger::PeerMessenger;
use super::wal::WriteAheadLog;
use crate::config::ClusterConfig;
use crate::storage::backend::KvStore;

/// Protocol timers.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub leader_wait: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            leader_wait: Duration::from_millis(3000),
        }
    }
}

impl Timing {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            election_timeout_min: Duration::from_millis(config.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            leader_wait: Duration::from_millis(config.leader_wait_ms),
        }
    }

    /// Uniform sample from `[election_timeout_min, election_timeout_max)`.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        if max <= min {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }

    /// Length of the first candidate round.
    pub fn election_round(&self) -> Duration {
        self.election_timeout_max * 2
    }

    /// Length of every restarted candidate round, jittered.
    pub fn election_restart(&self) -> Duration {
        self.election_round() + self.random_election_timeout()
    }

    /// How long the leader waits for a majority of AppendEntries acks.
    pub fn quorum_timeout(&self) -> Duration {
        self.election_timeout_max
    }
}

/// Protocol bookkeeping guarded by the metadata lock.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub role: Role,
    pub term: u64,
    /// Highest WAL index written (or claimed) locally.
    pub log_index: u64,
    /// Highest index known committed.  Never exceeds `log_index` on a
    /// follower.
    pub commit_index: u64,
    /// Highest index handed to the storage layer.
    pub applied_index: u64,
    /// Known leader address, empty when unknown.
    pub leader: String,
    /// Highest log index a leader has advertised to this node.  Bounds the
    /// catch-up pushes a follower accepts.
    pub leader_index: u64,
    /// A catch-up request is in flight.
    pub catching_up: bool,
    /// A follower commit walk is running.
    pub applying: bool,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            role: Role::Stopped,
            term: 0,
            log_index: 0,
            commit_index: 0,
            applied_index: 0,
            leader: String::new(),
            leader_index: 0,
            catching_up: false,
            applying: false,
        }
    }
}

/// Point-in-time view of a node, served by the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NodeStatus {
    pub address: String,
    #[schema(value_type = String)]
    pub role: Role,
    pub term: u64,
    pub log_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub leader: String,
    pub catching_up: bool,
    pub peers: Vec<String>,
    pub storage: String,
}

pub struct Shared {
    pub self_address: String,
    pub timing: Timing,
    pub membership: RwLock<Membership>,
    meta: Mutex<Metadata>,
    pub wal: tokio::sync::Mutex<WriteAheadLog>,
    /// Sender side of the node's event channel.
    pub events: mpsc::Sender<Event>,
    pub messenger: Arc<dyn PeerMessenger>,
    pub store: Arc<dyn KvStore>,
    leader_tx: watch::Sender<String>,
}

impl Shared {
    pub fn new(
        membership: Membership,
        timing: Timing,
        events: mpsc::Sender<Event>,
        messenger: Arc<dyn PeerMessenger>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let (leader_tx, _) = watch::channel(String::new());
        Self {
            self_address: membership.self_address().to_string(),
            timing,
            membership: RwLock::new(membership),
            meta: Mutex::new(Metadata::default()),
            wal: tokio::sync::Mutex::new(WriteAheadLog::new()),
            events,
            messenger,
            store,
            leader_tx,
        }
    }

    fn lock_meta(&self) -> MutexGuard<'_, Metadata> {
        // Metadata is plain data; a panicked holder cannot leave it torn.
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current metadata.
    pub fn snapshot(&self) -> Metadata {
        self.lock_meta().clone()
    }

    /// Mutate metadata under the lock, then publish gauges and any leader
    /// change.
    pub fn with_meta<R>(&self, f: impl FnOnce(&mut Metadata) -> R) -> R {
        let (result, leader_changed, meta) = {
            let mut meta = self.lock_meta();
            let before = meta.leader.clone();
            let result = f(&mut meta);
            (result, before != meta.leader, meta.clone())
        };
        crate::metrics::record_progress(meta.term, meta.log_index, meta.commit_index);
        if leader_changed {
            tracing::info!(leader = %meta.leader, term = meta.term, "leader changed");
            self.leader_tx.send_replace(meta.leader);
        }
        result
    }

    pub fn role(&self) -> Role {
        self.lock_meta().role
    }

    pub fn term(&self) -> u64 {
        self.lock_meta().term
    }

    pub fn leader(&self) -> String {
        self.lock_meta().leader.clone()
    }

    pub fn set_role(&self, role: Role) {
        self.with_meta(|meta| meta.role = role);
        crate::metrics::record_role(role);
    }

    /// Subscribe to leader changes.  The current value is empty while no
    /// leader is known.
    pub fn leader_watch(&self) -> watch::Receiver<String> {
        self.leader_tx.subscribe()
    }

    pub fn is_self(&self, address: &str) -> bool {
        self.self_address == address
    }

    pub fn peers(&self) -> Vec<String> {
        self.membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .peers()
            .to_vec()
    }

    pub fn majority(&self) -> usize {
        self.membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .majority()
    }

    /// Test-and-set the catch-up flag.  Returns `false` if a catch-up is
    /// already in flight.
    pub fn try_begin_catch_up(&self) -> bool {
        self.with_meta(|meta| {
            if meta.catching_up {
                false
            } else {
                meta.catching_up = true;
                true
            }
        })
    }

    pub fn finish_catch_up(&self) {
        self.with_meta(|meta| meta.catching_up = false);
    }

    /// Send a self-message to the node's event loop.  Only spawned workers
    /// may call this; a role loop awaiting its own channel would deadlock.
    pub async fn notify(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("event loop gone, dropping self-message");
        }
    }

    pub fn status(&self) -> NodeStatus {
        let meta = self.snapshot();
        NodeStatus {
            address: self.self_address.clone(),
            role: meta.role,
            term: meta.term,
            log_index: meta.log_index,
            commit_index: meta.commit_index,
            applied_index: meta.applied_index,
            leader: meta.leader,
            catching_up: meta.catching_up,
            peers: self.peers(),
            storage: self.store.name().to_string(),
        }
    }
}
