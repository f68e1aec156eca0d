//! Message definitions for the broker
//!
//! `Envelope` is the internal representation of one publish while it is being
//! routed. It exists only for the duration of a `Broker::publish` call; the
//! copies handed to subscribers are encoded into PUBLISH packets.
//!
//! Notes on fields:
//! - `topic`: validated topic name used for routing
//! - `payload`: opaque bytes, forwarded untouched
//! - `qos`: delivery mode. `0` = at-most-once, `1` = at-least-once
//! - `retain`: ask the broker to keep this message for future subscribers

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::broker::topic::TopicName;
use crate::utils::error::CodecError;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a requested subscription level onto what the broker grants.
    /// Exactly-once is not offered, so a request for it is granted at-least-once.
    pub fn granted(requested: u8) -> Option<Self> {
        match requested {
            0 => Some(Self::AtMostOnce),
            1 | 2 => Some(Self::AtLeastOnce),
            _ => None,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            other => Err(CodecError::InvalidQoS(other)),
        }
    }
}

/// A publish being routed through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Envelope {
    pub fn new(topic: TopicName, payload: impl Into<Bytes>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// The payload as text, with invalid UTF-8 replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Where a publish entered the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A connected client session, by client id.
    Client(String),
    /// Re-published from the upstream broker by the bridge connector.
    Bridge,
    /// Generated by the broker itself, e.g. aggregated state from a handler.
    Internal,
}

impl Origin {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Origin::Client(id) => Some(id),
            Origin::Bridge | Origin::Internal => None,
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self, Origin::Bridge)
    }

    /// Topic handlers only see traffic coming from outside the broker. Output
    /// of the handlers themselves is never fed back into them.
    pub fn dispatches_handlers(&self) -> bool {
        !matches!(self, Origin::Internal)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client(id) => write!(f, "client {id}"),
            Origin::Bridge => f.write_str("bridge"),
            Origin::Internal => f.write_str("broker"),
        }
    }
}
