use tokio::sync::mpsc::UnboundedSender;

use crate::transport::codec::Packet;

/// Instructions for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Encode and write a packet.
    Packet(Packet),
    /// Flush and close the transport, e.g. when the session is evicted.
    Close,
}

/// Represents a connected client in the broker.
///
/// Each client is identified by its MQTT client id and has a channel
/// (`sender`) feeding the task that writes to its transport.
#[derive(Debug, Clone)]
pub struct Client {
    /// MQTT client identifier, unique among connected clients.
    pub id: String,

    /// Channel to the connection's writer task.
    pub sender: UnboundedSender<Outgoing>,
}

impl Client {
    pub fn new(id: impl Into<String>, sender: UnboundedSender<Outgoing>) -> Self {
        Self {
            id: id.into(),
            sender,
        }
    }

    /// Queue a packet for the client. Returns `false` once the transport is gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(Outgoing::Packet(packet)).is_ok()
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) {
        let _ = self.sender.send(Outgoing::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
