//! Configuration for document replication.
//!
//! All configuration types can be constructed programmatically or
//! deserialized from YAML/JSON. Durations are humantime strings (`"250ms"`,
//! `"5s"`, `"2m"`) parsed on access; an unparseable value falls back to the
//! default for that field.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replication::config::ReplicationConfig;
//! use doc_replication::document::ReplicationDestination;
//!
//! let config = ReplicationConfig {
//!     node_tag: "A".into(),
//!     destinations: vec![ReplicationDestination::new("http://node-b:8080", "orders")],
//!     ..ReplicationConfig::for_testing("A", "orders")
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── node_tag / database_id / database_name / machine_name / url
//! ├── settings: ReplicationSettings
//! │   ├── registry: RegistryConfig       # backoff, rejection history, policy
//! │   ├── incoming: IncomingConfig       # handshake timeout, rate limiting
//! │   ├── outgoing: OutgoingConfig       # batch size, ack timeout, heartbeats
//! │   ├── reconnect: ReconnectConfig     # sweep interval
//! │   └── performance: PerformanceConfig # ring buffer, live session waits
//! ├── destinations: Vec<ReplicationDestination>
//! └── storage: StorageConfig             # SQLite conflicts/tombstones/watermarks
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_tag: "A"
//! database_id: "3f2c1a9e"
//! database_name: "orders"
//! machine_name: "db-london-1"
//! url: "http://db-london-1:8080"
//!
//! settings:
//!   registry:
//!     backoff_base: "1s"
//!     backoff_max: "5m"
//!   outgoing:
//!     batch_size: 256
//!     ack_timeout: "15s"
//!
//! destinations:
//!   - Url: "http://db-paris-1:8080"
//!     Database: "orders"
//!
//! storage:
//!   sqlite_path: "/var/lib/app/replication.db"
//! ```

use crate::document::ReplicationDestination;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::open()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's key in change vectors. Must be unique across the cluster.
    pub node_tag: String,

    /// Stable identifier of the local database; sent in handshakes.
    pub database_id: String,

    /// Database name; incoming handshakes must target it.
    pub database_name: String,

    #[serde(default = "default_machine_name")]
    pub machine_name: String,

    /// URL peers use to reach this node.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Outgoing replication targets.
    #[serde(default)]
    pub destinations: Vec<ReplicationDestination>,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_machine_name() -> String {
    "localhost".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_tag: "A".to_string(),
            database_id: "local.dev.database".to_string(),
            database_name: "default".to_string(),
            machine_name: default_machine_name(),
            url: "http://localhost:8080".to_string(),
            settings: ReplicationSettings::default(),
            destinations: Vec::new(),
            storage: StorageConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Minimal config for tests: in-memory SQLite and fast timers.
    pub fn for_testing(node_tag: &str, database_name: &str) -> Self {
        Self {
            node_tag: node_tag.to_string(),
            database_id: format!("{}-{}", database_name, node_tag).to_lowercase(),
            database_name: database_name.to_string(),
            machine_name: format!("machine-{}", node_tag.to_lowercase()),
            url: format!("http://{}.test:8080", node_tag.to_lowercase()),
            settings: ReplicationSettings::for_testing(),
            destinations: Vec::new(),
            storage: StorageConfig::in_memory(),
        }
    }

    /// Reject configurations that cannot work at all.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::ReplicationError;

        if self.node_tag.is_empty() || self.node_tag.contains([':', ',']) {
            return Err(ReplicationError::Config(format!(
                "node_tag '{}' must be non-empty and contain no ':' or ','",
                self.node_tag
            )));
        }
        if self.database_id.is_empty() || self.database_name.is_empty() {
            return Err(ReplicationError::Config(
                "database_id and database_name are required".to_string(),
            ));
        }
        if self.settings.outgoing.batch_size == 0 {
            return Err(ReplicationError::Config("outgoing.batch_size must be > 0".to_string()));
        }
        let intervals = [
            ("reconnect.sweep_interval", self.settings.reconnect.sweep_interval_duration()),
            ("outgoing.heartbeat_interval", self.settings.outgoing.heartbeat_interval_duration()),
            ("storage.watermark_flush_interval", self.storage.watermark_flush_interval_duration()),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ReplicationError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters for the replication subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub incoming: IncomingConfig,
    #[serde(default)]
    pub outgoing: OutgoingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            registry: RegistryConfig {
                backoff_base: "20ms".to_string(),
                backoff_max: "200ms".to_string(),
                ..RegistryConfig::default()
            },
            incoming: IncomingConfig {
                handshake_timeout: "1s".to_string(),
                ..IncomingConfig::default()
            },
            outgoing: OutgoingConfig {
                batch_size: 16,
                connect_timeout: "500ms".to_string(),
                ack_timeout: "500ms".to_string(),
                heartbeat_interval: "100ms".to_string(),
            },
            reconnect: ReconnectConfig {
                sweep_interval: "20ms".to_string(),
            },
            performance: PerformanceConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryConfig: backoff and rejection bookkeeping
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection registry settings.
///
/// Backoff after `n` consecutive failures is `min(backoff_max, backoff_base * 2^n)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    /// Rejection records kept per source; oldest evicted first.
    #[serde(default = "default_rejection_history_limit")]
    pub rejection_history_limit: usize,

    /// A newer incoming connection from the same source database closes the older one.
    #[serde(default = "default_true")]
    pub single_connection_per_source: bool,
}

fn default_backoff_base() -> String {
    "500ms".to_string()
}

fn default_backoff_max() -> String {
    "5m".to_string()
}

fn default_rejection_history_limit() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            rejection_history_limit: default_rejection_history_limit(),
            single_connection_per_source: true,
        }
    }
}

impl RegistryConfig {
    pub fn backoff_base_duration(&self) -> Duration {
        parse_or(&self.backoff_base, Duration::from_millis(500))
    }

    pub fn backoff_max_duration(&self) -> Duration {
        parse_or(&self.backoff_max, Duration::from_secs(300))
    }

    /// Retry schedule derived from the backoff settings.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig::exponential(
            self.backoff_base_duration(),
            self.backoff_max_duration(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IncomingConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Incoming handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingConfig {
    /// How long a freshly accepted connection may take to send its handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (thundering herd prevention)
    // ─────────────────────────────────────────────────────────────────────────

    /// Throttle item application across all incoming connections.
    /// Protects local writers when many peers reconnect at once.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Items per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_handshake_timeout() -> String {
    "10s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for IncomingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl IncomingConfig {
    pub fn handshake_timeout_duration(&self) -> Duration {
        parse_or(&self.handshake_timeout, Duration::from_secs(10))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutgoingConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Outgoing handler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingConfig {
    /// Maximum documents/tombstones per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Unacknowledged batch after this long counts as a failure.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: String,

    /// Idle connections send a heartbeat this often.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
}

fn default_batch_size() -> usize {
    256
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_ack_timeout() -> String {
    "15s".to_string()
}

fn default_heartbeat_interval() -> String {
    "5s".to_string()
}

impl Default for OutgoingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

impl OutgoingConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(5))
    }

    pub fn ack_timeout_duration(&self) -> Duration {
        parse_or(&self.ack_timeout, Duration::from_secs(15))
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        parse_or(&self.heartbeat_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconnectConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconnect sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// How often the engine drains due entries from the reconnect queue.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

fn default_sweep_interval() -> String {
    "1s".to_string()
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl ReconnectConfig {
    pub fn sweep_interval_duration(&self) -> Duration {
        parse_or(&self.sweep_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PerformanceConfig: telemetry retention and live sessions
// ═══════════════════════════════════════════════════════════════════════════════

/// Performance telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Samples retained per handler for polled snapshots.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Bounded queue size of each live collector.
    #[serde(default = "default_live_queue_capacity")]
    pub live_queue_capacity: usize,

    /// First dequeue wait of a live session.
    #[serde(default = "default_live_first_wait")]
    pub live_first_wait: String,

    /// Subsequent dequeue waits; a timeout produces a heartbeat.
    #[serde(default = "default_live_heartbeat_wait")]
    pub live_heartbeat_wait: String,
}

fn default_ring_capacity() -> usize {
    32
}

fn default_live_queue_capacity() -> usize {
    1024
}

fn default_live_first_wait() -> String {
    "100ms".to_string()
}

fn default_live_heartbeat_wait() -> String {
    "4s".to_string()
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            live_queue_capacity: default_live_queue_capacity(),
            live_first_wait: default_live_first_wait(),
            live_heartbeat_wait: default_live_heartbeat_wait(),
        }
    }
}

impl PerformanceConfig {
    pub fn live_first_wait_duration(&self) -> Duration {
        parse_or(&self.live_first_wait, Duration::from_millis(100))
    }

    pub fn live_heartbeat_wait_duration(&self) -> Duration {
        parse_or(&self.live_heartbeat_wait, Duration::from_millis(4000))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite settings for documents, conflicts, tombstones and watermarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path, or `:memory:`.
    pub sqlite_path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Debounce window for watermark persistence.
    #[serde(default = "default_watermark_flush_interval")]
    pub watermark_flush_interval: String,
}

fn default_max_connections() -> u32 {
    4
}

fn default_watermark_flush_interval() -> String {
    "5s".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication.db".to_string(),
            max_connections: default_max_connections(),
            watermark_flush_interval: default_watermark_flush_interval(),
        }
    }
}

impl StorageConfig {
    /// In-memory database for tests. Forces a single pooled connection.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            max_connections: 1,
            watermark_flush_interval: "1s".to_string(),
        }
    }

    pub fn at(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    pub fn watermark_flush_interval_duration(&self) -> Duration {
        parse_or(&self.watermark_flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_backoff_parsing() {
        let config = RegistryConfig {
            backoff_base: "250ms".to_string(),
            backoff_max: "1m".to_string(),
            ..Default::default()
        };
        assert_eq!(config.backoff_base_duration(), Duration::from_millis(250));
        assert_eq!(config.backoff_max_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = OutgoingConfig {
            ack_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.ack_timeout_duration(), Duration::from_secs(15));
    }

    #[test]
    fn test_incoming_rate_limit_config() {
        let mut config = IncomingConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 50;
        config.rate_limit_burst = 5;
        let rl = config.rate_limit_config().unwrap();
        assert_eq!(rl.refill_rate, 50);
        assert_eq!(rl.burst_size, 5);
    }

    #[test]
    fn test_performance_defaults_match_live_protocol() {
        let config = PerformanceConfig::default();
        assert_eq!(config.live_first_wait_duration(), Duration::from_millis(100));
        assert_eq!(config.live_heartbeat_wait_duration(), Duration::from_millis(4000));
    }

    #[test]
    fn test_storage_in_memory() {
        let config = StorageConfig::in_memory();
        assert!(config.is_in_memory());
        assert_eq!(config.max_connections, 1);
    }

    #[test]
    fn test_for_testing_config_validates() {
        let config = ReplicationConfig::for_testing("A", "orders");
        assert!(config.validate().is_ok());
        assert_eq!(config.database_id, "orders-a");
    }

    #[test]
    fn test_validate_rejects_bad_node_tag() {
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.node_tag = "A:1".to_string();
        assert!(config.validate().is_err());
        config.node_tag = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.settings.outgoing.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.settings.reconnect.sweep_interval = "0s".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sweep_interval"), "{}", err);

        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.settings.outgoing.heartbeat_interval = "0ms".to_string();
        assert!(config.validate().is_err());

        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.storage.watermark_flush_interval = "0s".to_string();
        assert!(config.validate().is_err());

        // Unparseable values fall back to the non-zero default.
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.settings.reconnect.sweep_interval = "never".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ReplicationConfig::for_testing("A", "orders");
        config.destinations.push(ReplicationDestination::new("http://b:8080", "orders"));
        let json = serde_json::to_string(&config).unwrap();
        let back: ReplicationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_tag, "A");
        assert_eq!(back.destinations.len(), 1);
        assert_eq!(back.settings.outgoing.batch_size, 16);
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "node_tag": "B",
            "database_id": "db-b",
            "database_name": "orders"
        }"#;
        let config: ReplicationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.settings.outgoing.batch_size, 256);
        assert!(config.settings.registry.single_connection_per_source);
        assert_eq!(config.storage.sqlite_path, "replication.db");
        assert!(config.destinations.is_empty());
    }
}
