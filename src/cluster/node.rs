//! Event-loop driver.
//!
//! Runs the handler for the current role until it returns the next role.
//! The driver is the single owner of role transitions.  However the loop
//! ends, normally or by a panic in a role handler, the node is marked
//! Stopped and the event receiver is parked again so the loop can be
//! restarted.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{error, info};

use super::message::{Event, Role};
use super::state::Shared;
use super::{candidate, follower, leader};
use crate::errors::ClusterError;

/// Where the event receiver waits while the loop is not running.
pub type InboxSlot = Arc<Mutex<Option<mpsc::Receiver<Event>>>>;

pub async fn run(shared: Arc<Shared>, inbox: mpsc::Receiver<Event>, slot: InboxSlot) {
    info!(address = %shared.self_address, "event loop started");
    let mut driver = Driver {
        shared,
        inbox: Some(inbox),
        slot,
    };
    driver.drive().await;
}

struct Driver {
    shared: Arc<Shared>,
    inbox: Option<mpsc::Receiver<Event>>,
    slot: InboxSlot,
}

impl Driver {
    async fn drive(&mut self) {
        let shared = Arc::clone(&self.shared);
        let Some(inbox) = self.inbox.as_mut() else {
            return;
        };
        let mut role = Role::Follower;
        loop {
            shared.set_role(role);
            let next = match role {
                Role::Follower => follower::run(&shared, inbox).await,
                Role::Candidate => candidate::run(&shared, inbox).await,
                Role::Leader => leader::run(&shared, inbox).await,
                Role::Stopped => break,
            };
            info!(from = %role, to = %next, term = shared.term(), "role transition");
            role = next;
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(address = %self.shared.self_address, "event loop panicked");
        }
        self.shared.with_meta(|meta| {
            meta.leader.clear();
            meta.catching_up = false;
        });
        self.shared.set_role(Role::Stopped);
        if let Some(mut inbox) = self.inbox.take() {
            while let Ok(event) = inbox.try_recv() {
                event.reject(ClusterError::NotRunning);
            }
            *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(inbox);
        }
        info!(address = %self.shared.self_address, "event loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::Membership;
    use crate::cluster::sim::RecordingMessenger;
    use crate::cluster::state::Timing;
    use crate::storage::memory::MemoryStore;

    #[tokio::test]
    async fn test_panicking_loop_stops_node_and_parks_inbox() {
        let (events, inbox) = mpsc::channel(1);
        let shared = Arc::new(Shared::new(
            Membership::new("node-1:1"),
            Timing::default(),
            events,
            Arc::new(RecordingMessenger::default()),
            Arc::new(MemoryStore::new()),
        ));
        shared.set_role(Role::Leader);
        shared.with_meta(|meta| meta.leader = "node-1:1".to_string());
        let slot: InboxSlot = Arc::new(Mutex::new(None));

        let task = {
            let shared = Arc::clone(&shared);
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                let _driver = Driver {
                    shared,
                    inbox: Some(inbox),
                    slot,
                };
                panic!("role handler failed");
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(shared.role(), Role::Stopped);
        assert!(shared.leader().is_empty());
        assert!(slot.lock().unwrap().is_some());
    }
}
