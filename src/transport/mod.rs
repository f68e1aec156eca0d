//! The `transport` module carries MQTT between clients and the broker.
//!
//! It contains the MQTT 3.1.1 codec, the per-connection protocol driver and
//! the two listeners feeding it: native MQTT over TCP and MQTT over
//! WebSocket for browser clients. Both listeners share one broker.

pub mod codec;
pub mod connection;
pub mod tcp;
pub mod websocket;

use tokio::net::TcpListener;

use crate::utils::error::ConfigurationError;

pub use tcp::serve_tcp;
pub use websocket::serve_websocket;

/// Bind a listener. A failure means the endpoint is misconfigured.
pub async fn bind(addr: &str) -> Result<TcpListener, ConfigurationError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ConfigurationError::Bind {
            addr: addr.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests;
