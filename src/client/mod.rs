//! The `client` module defines the broker-side handle of a connected client.
//!
//! A `Client` pairs the client id with the sending half of the queue drained
//! by that connection's writer task. The broker only ever enqueues; the
//! socket write happens on the connection's own task, so a slow client never
//! holds up delivery to others.

pub mod pubsub_client;
pub use pubsub_client::{Client, Outgoing};
