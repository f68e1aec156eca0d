//! The `bridge` module relays messages between the local broker and an
//! upstream (campus) broker.
//!
//! - [`BridgeConnector`] owns the upstream client connection: it connects
//!   with a fresh client id per attempt, subscribes to the configured filter,
//!   re-publishes what it receives locally and reconnects with exponential
//!   backoff whenever the connection fails.
//! - [`BridgeForwarder`] is a topic handler sending local commands below the
//!   outbound prefix to the upstream namespace.
//!
//! Messages re-published from upstream carry [`Origin::Bridge`] and are never
//! forwarded again; configuration additionally rejects an outbound namespace
//! that overlaps the upstream subscribe filter.
//!
//! [`Origin::Bridge`]: crate::broker::Origin::Bridge

pub mod backoff;
pub mod connector;
pub mod forward;

use std::sync::Arc;

use crate::broker::Broker;
use crate::config::BridgeSettings;
use crate::utils::error::ConfigurationError;

pub use backoff::Backoff;
pub use connector::{BridgeConnector, BridgeState, UpstreamLink};
pub use forward::{BridgeForwarder, extract_forward_value, translate_topic};

/// Register the forwarder on `broker` and return the connector to run.
pub fn install(
    settings: &BridgeSettings,
    broker: Arc<Broker>,
) -> Result<BridgeConnector, ConfigurationError> {
    let link = Arc::new(UpstreamLink::new());
    let forwarder = BridgeForwarder::from_settings(settings, link.clone())?;
    broker.register_handler(Arc::new(forwarder));
    Ok(BridgeConnector::new(settings.clone(), broker, link))
}

#[cfg(test)]
mod tests;
