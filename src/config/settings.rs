use std::time::Duration;

use serde::Deserialize;

use crate::aggregator::TriggerPolicy;
use crate::transport::codec::DEFAULT_MAX_PACKET_SIZE;

/// Top-level configuration settings for the application.
///
/// Every section falls back to its defaults, so a partial file (or no file at
/// all) still yields a complete configuration.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub bridge: BridgeSettings,
    pub aggregator: AggregatorSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Listener endpoints. Both listeners feed the same broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    /// Native MQTT over TCP.
    pub tcp_port: u16,
    /// MQTT over WebSocket, for browser clients.
    pub ws_port: u16,
}

impl ServerSettings {
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.host, self.ws_port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            tcp_port: 1883,
            ws_port: 1884,
        }
    }
}

/// Operational limits of the broker engine and its connections.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub max_packet_size: usize,
    /// Time a new connection gets to send its CONNECT.
    pub connect_timeout_secs: u64,
    /// Upper bound for writing one packet to a client.
    pub write_timeout_ms: u64,
    /// Age after which an unacknowledged QoS 1 publish is resent.
    pub ack_timeout_ms: u64,
    /// Resends before an unacknowledged publish is dropped.
    pub max_retries: u8,
    pub retry_interval_ms: u64,
}

impl BrokerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            connect_timeout_secs: 10,
            write_timeout_ms: 5000,
            ack_timeout_ms: 5000,
            max_retries: 5,
            retry_interval_ms: 1000,
        }
    }
}

/// Upstream bridge endpoint and topic translation.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Filter subscribed on the upstream broker; matches are re-published locally.
    pub subscribe_filter: String,
    /// Local namespace whose publishes are forwarded upstream.
    pub outbound_prefix: String,
    /// Upstream namespace replacing `outbound_prefix` on forwarded topics.
    pub upstream_prefix: String,
    pub client_id_prefix: String,
    /// Debug topic receiving a one-shot publish after each successful connect.
    /// Empty disables it.
    pub heartbeat_topic: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl BridgeSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn heartbeat_topic(&self) -> Option<&str> {
        self.heartbeat_topic
            .as_deref()
            .filter(|topic| !topic.trim().is_empty())
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            subscribe_filter: "conveyor/raw/#".to_string(),
            outbound_prefix: "hmi".to_string(),
            upstream_prefix: "conveyor/cmd".to_string(),
            client_id_prefix: "rigbroker-bridge".to_string(),
            heartbeat_topic: Some("rigbroker/debug/heartbeat".to_string()),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

/// Conveyor state aggregation.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AggregatorSettings {
    pub enabled: bool,
    /// Filter of raw updates fed to the aggregator.
    pub topic_filter: String,
    pub trigger: TriggerPolicy,
    /// Record kind handed to the persistence gateway.
    pub record_kind: String,
    /// Consolidated point states are published under `{prefix}/{point}/state`.
    pub state_topic_prefix: String,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            topic_filter: "conveyor/raw/#".to_string(),
            trigger: TriggerPolicy::default(),
            record_kind: "machine_logs".to_string(),
            state_topic_prefix: "conveyor/outer/point".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// Records are only logged.
    #[default]
    None,
    /// Records are stored in an embedded sled database.
    Sled,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PersistenceSettings {
    pub backend: PersistenceBackend,
    /// Database directory; required by the sled backend.
    pub path: Option<String>,
    /// Records older than this are pruned on insert.
    pub retention_secs: Option<i64>,
    /// JSON publishes stored verbatim, one record kind per filter.
    pub routes: Vec<RecordRoute>,
}

/// Publishes matching `filter` are stored as records of `kind`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RecordRoute {
    pub filter: String,
    pub kind: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
