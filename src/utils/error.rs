//! The `error` module defines the error types used within `rigbroker`.
//!
//! Every fault class of the broker has its own enum here. Only
//! [`ConfigurationError`] is allowed to reach `main` and stop the process;
//! the others are turned into log lines at the point where they occur.

use thiserror::Error;

/// Errors raised while parsing a topic name or a subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,

    #[error("topic cannot contain a null character")]
    NullCharacter,

    #[error("published topic `{0}` cannot contain wildcards")]
    WildcardInTopic(String),

    #[error("`#` must be the last segment of filter `{0}`")]
    MisplacedMultiLevel(String),

    #[error("wildcards must occupy a whole segment in filter `{0}`")]
    PartialWildcard(String),
}

/// Errors raised by the MQTT packet codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    #[error("packet type {0} is not supported")]
    Unsupported(u8),

    #[error("invalid fixed header flags {flags:#06b} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("malformed remaining length")]
    MalformedLength,

    #[error("packet of {size} bytes exceeds the limit of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("string is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid qos level {0}")]
    InvalidQoS(u8),

    #[error("exactly-once (qos 2) publishes are not supported")]
    ExactlyOnceUnsupported,
}

/// Errors raised while driving a client connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Errors raised by the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session `{0}` is not connected")]
    UnknownSession(String),
}

/// Failures of the upstream bridge. They drive the connector into its retry
/// state and are never fatal.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is offline")]
    Offline,

    #[error("upstream client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("upstream connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("no CONNACK from upstream within {0:?}")]
    ConnectTimeout(std::time::Duration),
}

/// Errors returned by the persistence gateway.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by a topic handler. The router logs them and carries on.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Fatal configuration problems. These terminate the process.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("invalid topic in `{key}`: {source}")]
    Topic {
        key: &'static str,
        #[source]
        source: TopicError,
    },

    #[error(
        "bridge outbound namespace `{outbound}` overlaps upstream filter `{subscribe}`; \
         forwarded messages would loop between brokers"
    )]
    BridgeLoop { outbound: String, subscribe: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open persistence store at `{path}`: {source}")]
    Persistence {
        path: String,
        #[source]
        source: PersistenceError,
    },
}
