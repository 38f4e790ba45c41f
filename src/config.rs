//! Configuration loading and management.

use meshsync_proto::ReplicaId;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node identity and listeners.
    pub node: NodeConfig,
    /// Replication tuning.
    #[serde(default)]
    pub replication: ReplicationOptions,
    /// Bootstrap address book.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// Optional collaboration keys. Without them payloads travel in the clear.
    pub keys: Option<KeysConfig>,
}

/// Node identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Replica id of this node.
    pub id: String,
    /// Address to accept replication connections on (e.g., "0.0.0.0:7420").
    pub listen: SocketAddr,
    /// Name of the collaboration to join.
    #[serde(default = "default_collaboration")]
    pub collaboration: String,
    /// Port for the Prometheus `/metrics` endpoint. Disabled when absent.
    pub metrics_port: Option<u16>,
    /// Log output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// A known peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    /// The peer's replica id.
    pub id: String,
    /// Where it listens.
    pub address: SocketAddr,
}

/// Key material, base64 encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Ed25519 key pair as a PKCS#8 v2 document.
    pub signing_key: String,
    /// 32-byte ChaCha20-Poly1305 key.
    pub cipher_key: String,
}

/// Tuning knobs for the replication engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationOptions {
    /// Delay before pushing local changes to an ordinary peer.
    #[serde(default = "default_debounce_push_ms")]
    pub debounce_push_ms: u64,
    /// Delay before pushing local changes to a pinner.
    #[serde(default = "default_debounce_push_to_pinner_ms")]
    pub debounce_push_to_pinner_ms: u64,
    /// How long the pull side waits for data announced by a clock before
    /// asking for eager mode.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Pinner mode: replicate everything, never decrypt.
    #[serde(default)]
    pub replicate_only: bool,
    /// Coalescing window for ring changes before reconnecting.
    #[serde(default = "default_debounce_reset_connections_ms")]
    pub debounce_reset_connections_ms: u64,
    /// Safety-net reconciliation period.
    #[serde(default = "default_reset_connection_interval_ms")]
    pub reset_connection_interval_ms: u64,
    /// Consecutive failed dials before a peer is evicted from the ring.
    #[serde(default = "default_max_unreachable_before_eviction")]
    pub max_unreachable_before_eviction: u32,
    /// Bytes of the peer id hash used as ring key.
    #[serde(default = "default_ring_key_bytes")]
    pub ring_key_bytes: usize,
}

// =============================================================================
// Defaults
// =============================================================================

fn default_collaboration() -> String {
    "default".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_debounce_push_ms() -> u64 {
    200
}

fn default_debounce_push_to_pinner_ms() -> u64 {
    5_000
}

fn default_receive_timeout_ms() -> u64 {
    3_000
}

fn default_debounce_reset_connections_ms() -> u64 {
    1_000
}

fn default_reset_connection_interval_ms() -> u64 {
    6_000
}

fn default_max_unreachable_before_eviction() -> u32 {
    10
}

fn default_ring_key_bytes() -> usize {
    2
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            debounce_push_ms: default_debounce_push_ms(),
            debounce_push_to_pinner_ms: default_debounce_push_to_pinner_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            replicate_only: false,
            debounce_reset_connections_ms: default_debounce_reset_connections_ms(),
            reset_connection_interval_ms: default_reset_connection_interval_ms(),
            max_unreachable_before_eviction: default_max_unreachable_before_eviction(),
            ring_key_bytes: default_ring_key_bytes(),
        }
    }
}

impl ReplicationOptions {
    pub fn debounce_push(&self) -> Duration {
        Duration::from_millis(self.debounce_push_ms)
    }

    pub fn debounce_push_to_pinner(&self) -> Duration {
        Duration::from_millis(self.debounce_push_to_pinner_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn debounce_reset_connections(&self) -> Duration {
        Duration::from_millis(self.debounce_reset_connections_ms)
    }

    pub fn reset_connection_interval(&self) -> Duration {
        Duration::from_millis(self.reset_connection_interval_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timers = [
            ("debounce_push_ms", self.debounce_push_ms),
            ("debounce_push_to_pinner_ms", self.debounce_push_to_pinner_ms),
            ("receive_timeout_ms", self.receive_timeout_ms),
            ("debounce_reset_connections_ms", self.debounce_reset_connections_ms),
            ("reset_connection_interval_ms", self.reset_connection_interval_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("replication.{name} must be positive")));
        }
        if self.max_unreachable_before_eviction == 0 {
            return Err(ConfigError::Invalid(
                "replication.max_unreachable_before_eviction must be positive".to_string(),
            ));
        }
        if !(1..=8).contains(&self.ring_key_bytes) {
            return Err(ConfigError::Invalid(format!(
                "replication.ring_key_bytes must be within 1..=8, got {}",
                self.ring_key_bytes
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::Invalid("node.id is required".to_string()));
        }
        if !matches!(self.node.log_format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "node.log_format must be \"text\" or \"json\", got {:?}",
                self.node.log_format
            )));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.id == self.node.id) {
            return Err(ConfigError::Invalid(format!(
                "peers must not list this node ({})",
                peer.id
            )));
        }
        self.replication.validate()
    }

    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::new(self.node.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [node]
        id = "alpha"
        listen = "127.0.0.1:7420"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::parse(MINIMAL).unwrap();
        let r = &config.replication;
        assert_eq!(r.debounce_push_ms, 200);
        assert_eq!(r.debounce_push_to_pinner_ms, 5_000);
        assert_eq!(r.receive_timeout_ms, 3_000);
        assert!(!r.replicate_only);
        assert_eq!(r.debounce_reset_connections_ms, 1_000);
        assert_eq!(r.reset_connection_interval_ms, 6_000);
        assert_eq!(r.max_unreachable_before_eviction, 10);
        assert_eq!(r.ring_key_bytes, 2);
        assert_eq!(config.node.collaboration, "default");
        assert!(config.keys.is_none());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [node]
            id = "alpha"
            listen = "127.0.0.1:7420"
            collaboration = "notes"
            metrics_port = 9100

            [replication]
            replicate_only = true
            receive_timeout_ms = 500

            [[peers]]
            id = "beta"
            address = "127.0.0.1:7421"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.metrics_port, Some(9100));
        assert!(config.replication.replicate_only);
        assert_eq!(config.replication.receive_timeout(), Duration::from_millis(500));
        assert_eq!(config.replication.debounce_push_ms, 200);
        assert_eq!(config.peers[0].id, "beta");
        assert_eq!(config.replica_id(), ReplicaId::new("alpha"));
    }

    #[test]
    fn test_rejects_bad_ring_key_bytes() {
        let toml = format!("{MINIMAL}\n[replication]\nring_key_bytes = 9\n");
        assert!(matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let toml = format!("{MINIMAL}\n[replication]\nmax_unreachable_before_eviction = 0\n");
        assert!(matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_zero_timer() {
        let toml = format!("{MINIMAL}\n[replication]\nreceive_timeout_ms = 0\n");
        assert!(matches!(Config::parse(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.node.id, "alpha");

        assert!(matches!(
            Config::load("/nonexistent/meshsync.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
