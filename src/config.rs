//! Configuration for the replication client.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are humantime strings (`"5s"`, `"250ms"`) and are
//! parsed lazily; an unparseable string falls back to the default.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_client::config::{ClientConfig, ConnectInfo};
//!
//! let connect = ConnectInfo::new("127.0.0.1", 3306, "repl", "secret", 1001);
//! let config = ClientConfig::default();
//! assert_eq!(config.queue.capacity, 2500);
//! assert_eq!(connect.endpoint(), "127.0.0.1:3306");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ClientConfig
//! ├── session: SessionConfig        # connect/command/heartbeat timeouts
//! ├── queue: QueueConfig            # backpressure queue capacity
//! ├── reconnect: ReconnectConfig    # retry budget + backoff
//! ├── checkpoint: CheckpointConfig  # SQLite position persistence
//! └── dispatch: DispatchConfig      # consumer loop tuning
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! session:
//!   connect_timeout: "5s"
//!   command_timeout: "5s"
//!   heartbeat_interval: "15s"
//! queue:
//!   capacity: 2500
//! reconnect:
//!   max_retries: 5
//!   base_delay: "1s"
//! checkpoint:
//!   sqlite_path: "/var/lib/app/positions.db"
//! ```

use crate::resilience::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectInfo: where to connect and who we are
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection target and credentials. Immutable once built.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Default database (binlog variant: sent in the handshake response).
    #[serde(default)]
    pub database: Option<String>,
    /// Source identifier. For MySQL this is the replica server id used by
    /// COM_REGISTER_SLAVE and COM_BINLOG_DUMP; it must be unique among the
    /// server's replicas.
    pub server_id: u32,
}

impl ConnectInfo {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        server_id: u32,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            database: None,
            server_id,
        }
    }

    /// Set the default database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// `host:port`, used as the endpoint key in logs, metrics and
    /// checkpoint store keys.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Local connect info for tests against mock servers.
    pub fn for_testing(port: u16) -> Self {
        Self::new("127.0.0.1", port, "root", "root", 1001)
    }
}

impl std::fmt::Debug for ConnectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("server_id", &self.server_id)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClientConfig: top-level
// ═══════════════════════════════════════════════════════════════════════════════

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl ClientConfig {
    /// Short timeouts and a tiny retry budget for tests.
    pub fn for_testing() -> Self {
        Self {
            session: SessionConfig::for_testing(),
            queue: QueueConfig::default(),
            reconnect: ReconnectConfig::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
            dispatch: DispatchConfig::for_testing(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SessionConfig: per-connection timeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-session timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// How long a correlated command waits for its response.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,

    /// Heartbeat period requested from the server while streaming.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// A streaming connection with no inbound frame for
    /// `heartbeat_interval * idle_multiplier` is considered dead.
    #[serde(default = "default_idle_multiplier")]
    pub idle_multiplier: u32,
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

fn default_command_timeout() -> String {
    "5s".to_string()
}

fn default_heartbeat_interval() -> String {
    "15s".to_string()
}

fn default_idle_multiplier() -> u32 {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_multiplier: default_idle_multiplier(),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: "500ms".to_string(),
            command_timeout: "1s".to_string(),
            heartbeat_interval: "15s".to_string(),
            idle_multiplier: 3,
        }
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(5))
    }

    pub fn command_timeout_duration(&self) -> Duration {
        parse_or(&self.command_timeout, Duration::from_secs(5))
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        parse_or(&self.heartbeat_interval, Duration::from_secs(15))
    }

    /// Inbound silence after which a streaming connection is declared dead.
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval_duration() * self.idle_multiplier.max(1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Backpressure queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum batches buffered between the I/O task and the consumer.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    2500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconnectConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconnect budget and backoff.
///
/// Attempt `n` (0-indexed) is followed by a sleep of `base_delay << n`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect attempts before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "5m".to_string()
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl ReconnectConfig {
    pub fn for_testing() -> Self {
        Self {
            max_retries: 3,
            base_delay: "10ms".to_string(),
            max_delay: "1s".to_string(),
        }
    }

    pub fn base_delay_duration(&self) -> Duration {
        parse_or(&self.base_delay, Duration::from_secs(1))
    }

    pub fn max_delay_duration(&self) -> Duration {
        parse_or(&self.max_delay, Duration::from_secs(300))
    }

    /// Build the runtime policy.
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay_duration(),
            max_delay: self.max_delay_duration(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Position persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Path to the SQLite database for positions.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// How often the dispatcher flushes debounced positions to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_true() -> bool {
    true
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_positions.db".to_string(),
            wal_mode: true,
            flush_interval: default_flush_interval(),
        }
    }
}

impl CheckpointConfig {
    /// In-memory SQLite for tests.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            flush_interval: "100ms".to_string(),
        }
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer dispatch loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// `poll()` timeout per iteration.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: String,

    /// Initial delay before re-applying a batch the sink rejected.
    #[serde(default = "default_sink_retry_delay")]
    pub sink_retry_delay: String,

    /// Ceiling for sink retry backoff.
    #[serde(default = "default_sink_retry_max_delay")]
    pub sink_retry_max_delay: String,
}

fn default_poll_timeout() -> String {
    "500ms".to_string()
}

fn default_sink_retry_delay() -> String {
    "100ms".to_string()
}

fn default_sink_retry_max_delay() -> String {
    "10s".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_timeout: default_poll_timeout(),
            sink_retry_delay: default_sink_retry_delay(),
            sink_retry_max_delay: default_sink_retry_max_delay(),
        }
    }
}

impl DispatchConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_timeout: "20ms".to_string(),
            sink_retry_delay: "5ms".to_string(),
            sink_retry_max_delay: "50ms".to_string(),
        }
    }

    pub fn poll_timeout_duration(&self) -> Duration {
        parse_or(&self.poll_timeout, Duration::from_millis(500))
    }

    pub fn sink_retry_delay_duration(&self) -> Duration {
        parse_or(&self.sink_retry_delay, Duration::from_millis(100))
    }

    pub fn sink_retry_max_delay_duration(&self) -> Duration {
        parse_or(&self.sink_retry_max_delay, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_info_endpoint() {
        let info = ConnectInfo::new("db.internal", 3307, "repl", "pw", 42);
        assert_eq!(info.endpoint(), "db.internal:3307");
        assert_eq!(info.server_id, 42);
        assert!(info.database.is_none());
    }

    #[test]
    fn test_connect_info_debug_hides_password() {
        let info = ConnectInfo::new("h", 1, "u", "hunter2", 1);
        let debug = format!("{:?}", info);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(5));
        assert_eq!(config.command_timeout_duration(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval_duration(), Duration::from_secs(15));
        assert_eq!(config.idle_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_duration_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = SessionConfig {
                command_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.command_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let config = SessionConfig {
            connect_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_idle_multiplier_zero_is_clamped() {
        let config = SessionConfig {
            heartbeat_interval: "2s".to_string(),
            idle_multiplier: 0,
            ..Default::default()
        };
        assert_eq!(config.idle_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_reconnect_policy_from_config() {
        let config = ReconnectConfig {
            max_retries: 7,
            base_delay: "250ms".to_string(),
            max_delay: "30s".to_string(),
        };
        let policy = config.policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let json = r#"{ "queue": { "capacity": 10 }, "reconnect": { "max_retries": 9 } }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.reconnect.max_retries, 9);
        assert_eq!(config.reconnect.base_delay, "1s");
        assert_eq!(config.session.heartbeat_interval, "15s");
        assert!(config.checkpoint.wal_mode);
    }

    #[test]
    fn test_deserialize_connect_info() {
        let json = r#"{ "host": "h", "port": 3306, "username": "u", "server_id": 9 }"#;
        let info: ConnectInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.password, "");
        assert_eq!(info.server_id, 9);
    }

    #[test]
    fn test_checkpoint_in_memory() {
        let config = CheckpointConfig::in_memory();
        assert_eq!(config.sqlite_path, ":memory:");
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_for_testing_is_fast() {
        let config = ClientConfig::for_testing();
        assert!(config.session.connect_timeout_duration() < Duration::from_secs(1));
        assert!(config.reconnect.base_delay_duration() < Duration::from_millis(100));
        assert!(config.dispatch.poll_timeout_duration() < Duration::from_millis(100));
    }
}
