//! kvraft library: a Raft-inspired replication layer for a key/value front end.
//!
//! This crate provides the replication state machine, the HTTP peer
//! protocol and client API, pluggable storage backends the committed
//! writes are applied to, and the ambient configuration and metrics.

use std::sync::Arc;

pub mod cluster;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod server;
pub mod storage;

use crate::cluster::Cluster;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// This node's replication layer.
    pub cluster: Arc<Cluster>,
}
