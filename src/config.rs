//! Configuration loading and types for kvraft.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! node: the HTTP listener, the replication protocol, the storage layer
//! committed writes are applied to, and logging/observability.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Replication and membership settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Storage layer committed entries are applied to.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Replication protocol configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Address peers use to reach this node (`host:port`).  Falls back to
    /// the bind address when empty.
    #[serde(default)]
    pub self_address: String,

    /// Peers registered at startup, excluding this node.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Lower bound of the randomized follower election timeout.
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Upper bound (exclusive) of the randomized follower election timeout.
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// Leader heartbeat period.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Per-request timeout for peer HTTP calls.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,

    /// How long a client write waits for a leader to become known.
    #[serde(default = "default_leader_wait_ms")]
    pub leader_wait_ms: u64,

    /// Shared secret for the peer routes.  Empty disables the check.
    #[serde(default)]
    pub internal_token: String,

    /// Start the event loop at boot once the peer list is startable.
    #[serde(default)]
    pub auto_start: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_address: String::new(),
            peers: Vec::new(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            leader_wait_ms: default_leader_wait_ms(),
            internal_token: String::new(),
            auto_start: false,
        }
    }
}

impl ClusterConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

/// Storage layer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `memory`, `sqlite` or `http`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// SQLite backend configuration.
    #[serde(default)]
    pub sqlite: SqliteStorageConfig,

    /// HTTP forwarding backend configuration.
    #[serde(default)]
    pub http: HttpStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite: SqliteStorageConfig::default(),
            http: HttpStorageConfig::default(),
        }
    }
}

/// SQLite backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

/// HTTP forwarding backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpStorageConfig {
    /// Base URL of the storage service, e.g. `http://127.0.0.1:9000`.
    #[serde(default)]
    pub endpoint: String,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_http_storage_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HttpStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_ms: default_http_storage_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and the `/health` probe.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

fn default_heartbeat_interval_ms() -> u64 {
    50
}

fn default_peer_timeout_ms() -> u64 {
    1000
}

fn default_leader_wait_ms() -> u64 {
    3000
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> String {
    "./data/kvraft.db".to_string()
}

fn default_http_storage_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Reject settings the protocol cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let cluster = &self.cluster;
        if cluster.election_timeout_min_ms == 0
            || cluster.election_timeout_min_ms >= cluster.election_timeout_max_ms
        {
            anyhow::bail!(
                "cluster.election_timeout_min_ms ({}) must be positive and below election_timeout_max_ms ({})",
                cluster.election_timeout_min_ms,
                cluster.election_timeout_max_ms
            );
        }
        if cluster.heartbeat_interval_ms == 0
            || cluster.heartbeat_interval_ms >= cluster.election_timeout_min_ms
        {
            anyhow::bail!(
                "cluster.heartbeat_interval_ms ({}) must be positive and below election_timeout_min_ms ({})",
                cluster.heartbeat_interval_ms,
                cluster.election_timeout_min_ms
            );
        }
        match self.storage.backend.as_str() {
            "memory" | "sqlite" => {}
            "http" if !self.storage.http.endpoint.is_empty() => {}
            "http" => anyhow::bail!("storage.backend is 'http' but storage.http.endpoint is empty"),
            other => anyhow::bail!("unknown storage.backend '{other}'"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.cluster.election_timeout_min_ms, 150);
        assert_eq!(config.cluster.election_timeout_max_ms, 300);
        assert_eq!(config.cluster.heartbeat_interval_ms, 50);
        assert_eq!(config.cluster.leader_wait_ms, 3000);
        assert_eq!(config.storage.backend, "memory");
        assert!(config.observability.metrics);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_cluster_section() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9001
cluster:
  self_address: 10.0.0.1:9001
  peers:
    - 10.0.0.2:9001
    - 10.0.0.3:9001
  internal_token: s3cret
  auto_start: true
storage:
  backend: sqlite
  sqlite:
    path: /tmp/kv.db
logging:
  format: json
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.cluster.self_address, "10.0.0.1:9001");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.internal_token, "s3cret");
        assert!(config.cluster.auto_start);
        assert_eq!(config.storage.sqlite.path, "/tmp/kv.db");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let yaml = "cluster:\n  election_timeout_min_ms: 300\n  election_timeout_max_ms: 150\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_heartbeat() {
        let yaml = "cluster:\n  heartbeat_interval_ms: 200\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_http_backend_needs_endpoint() {
        let yaml = "storage:\n  backend: http\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());

        let yaml = "storage:\n  backend: http\n  http:\n    endpoint: http://127.0.0.1:9000\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvraft.yaml");
        std::fs::write(&path, "server:\n  port: 7000\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_example_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/kvraft.example.yaml");
        let config = load_config(path).unwrap();
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.storage.backend, "memory");
    }
}
