//! Local → upstream forwarding.
//!
//! Publishes below the outbound prefix (commands from the HMI) are rewritten
//! into the upstream namespace and sent through the bridge link. Only the
//! command value travels upstream, extracted from the JSON payload:
//! a boolean `state` becomes `"1"`/`"0"`, a numeric `value` its decimal form.
//! Anything else is not forwarded.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::aggregator::encode_bool;
use crate::bridge::connector::UpstreamLink;
use crate::broker::{Envelope, Origin, Publisher, TopicFilter, TopicHandler, TopicName};
use crate::config::BridgeSettings;
use crate::utils::error::{BridgeError, ConfigurationError, HandlerError};

/// Boolean command field.
pub const STATE_FIELD: &str = "state";
/// Numeric command field.
pub const VALUE_FIELD: &str = "value";

/// Rewrite `topic` from the local `outbound_prefix` namespace into
/// `upstream_prefix`. `None` when the topic is outside the namespace.
pub fn translate_topic(
    topic: &TopicName,
    outbound_prefix: &str,
    upstream_prefix: &str,
) -> Option<String> {
    match topic.strip_prefix(outbound_prefix)? {
        "" => Some(upstream_prefix.to_string()),
        rest => Some(format!("{upstream_prefix}/{rest}")),
    }
}

/// Value to send upstream for a command payload.
pub fn extract_forward_value(payload: &[u8]) -> Result<Option<String>, serde_json::Error> {
    let Value::Object(object) = serde_json::from_slice::<Value>(payload)? else {
        return Ok(None);
    };

    if let Some(Value::Bool(state)) = object.get(STATE_FIELD) {
        return Ok(Some(encode_bool(*state).to_string()));
    }
    match object.get(VALUE_FIELD) {
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(Value::Bool(value)) => Ok(Some(encode_bool(*value).to_string())),
        _ => Ok(None),
    }
}

pub struct BridgeForwarder {
    interest: TopicFilter,
    outbound_prefix: String,
    upstream_prefix: String,
    link: Arc<UpstreamLink>,
}

impl BridgeForwarder {
    pub fn new(
        outbound_prefix: impl Into<String>,
        upstream_prefix: impl Into<String>,
        link: Arc<UpstreamLink>,
    ) -> Result<Self, ConfigurationError> {
        let outbound_prefix = outbound_prefix.into();
        let interest =
            TopicFilter::namespace(&outbound_prefix).map_err(|source| ConfigurationError::Topic {
                key: "bridge.outbound_prefix",
                source,
            })?;
        Ok(Self {
            interest,
            outbound_prefix,
            upstream_prefix: upstream_prefix.into(),
            link,
        })
    }

    pub fn from_settings(
        settings: &BridgeSettings,
        link: Arc<UpstreamLink>,
    ) -> Result<Self, ConfigurationError> {
        Self::new(
            settings.outbound_prefix.as_str(),
            settings.upstream_prefix.as_str(),
            link,
        )
    }
}

impl TopicHandler for BridgeForwarder {
    fn name(&self) -> &str {
        "bridge-forwarder"
    }

    fn interest(&self) -> &TopicFilter {
        &self.interest
    }

    fn handle(
        &self,
        envelope: &Envelope,
        origin: &Origin,
        _publisher: &Publisher<'_>,
    ) -> Result<(), HandlerError> {
        // Whatever came from upstream never goes back there.
        if origin.is_bridge() {
            debug!("Not forwarding '{}': received from upstream", envelope.topic);
            return Ok(());
        }

        let Some(topic) =
            translate_topic(&envelope.topic, &self.outbound_prefix, &self.upstream_prefix)
        else {
            return Ok(());
        };

        let value = match extract_forward_value(&envelope.payload) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("Not forwarding '{}': no command value", envelope.topic);
                return Ok(());
            }
            Err(e) => {
                warn!("Not forwarding '{}': invalid JSON: {e}", envelope.topic);
                return Ok(());
            }
        };

        match self.link.publish(&topic, value) {
            Ok(()) => {
                debug!("Forwarded '{}' upstream as '{topic}'", envelope.topic);
                Ok(())
            }
            Err(BridgeError::Offline) => {
                warn!("Dropping '{}': bridge is offline", envelope.topic);
                Ok(())
            }
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        }
    }
}
