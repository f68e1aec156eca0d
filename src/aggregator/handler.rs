use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::aggregator::{StateAggregator, TriggerPolicy, Update};
use crate::broker::{Envelope, Origin, Publisher, QoS, TopicFilter, TopicHandler, TopicName};
use crate::config::AggregatorSettings;
use crate::persistence::PersistenceGateway;
use crate::utils::error::{ConfigurationError, HandlerError};

/// Feeds publishes into a [`StateAggregator`]; on consolidation it publishes
/// the point state and inserts the record through the persistence gateway.
pub struct AggregatorHandler {
    interest: TopicFilter,
    state_topic_prefix: TopicName,
    record_kind: String,
    aggregator: Mutex<StateAggregator>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl AggregatorHandler {
    pub fn new(
        interest: TopicFilter,
        state_topic_prefix: TopicName,
        record_kind: impl Into<String>,
        trigger: TriggerPolicy,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            interest,
            state_topic_prefix,
            record_kind: record_kind.into(),
            aggregator: Mutex::new(StateAggregator::new(trigger)),
            gateway,
        }
    }

    pub fn from_settings(
        settings: &AggregatorSettings,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Self, ConfigurationError> {
        let interest = TopicFilter::new(settings.topic_filter.as_str()).map_err(|source| {
            ConfigurationError::Topic {
                key: "aggregator.topic_filter",
                source,
            }
        })?;
        let prefix = TopicName::new(settings.state_topic_prefix.as_str()).map_err(|source| {
            ConfigurationError::Topic {
                key: "aggregator.state_topic_prefix",
                source,
            }
        })?;
        Ok(Self::new(
            interest,
            prefix,
            settings.record_kind.as_str(),
            settings.trigger,
            gateway,
        ))
    }

    /// Apply one raw update under the aggregator lock.
    pub fn apply(&self, topic: &str, raw: &str) -> Update {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_raw_update(topic, raw)
    }

    /// A copy of the current snapshot.
    pub fn snapshot(&self) -> crate::aggregator::Snapshot {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
            .clone()
    }
}

impl TopicHandler for AggregatorHandler {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn interest(&self) -> &TopicFilter {
        &self.interest
    }

    fn handle(
        &self,
        envelope: &Envelope,
        origin: &Origin,
        publisher: &Publisher<'_>,
    ) -> Result<(), HandlerError> {
        let update = self.apply(envelope.topic.as_str(), &envelope.payload_str());
        let Some(consolidated) = update.consolidated else {
            return Ok(());
        };

        info!(
            "Point {} is {} (update from {origin})",
            consolidated.point_id(),
            consolidated.state
        );

        let topic = TopicName::new(format!(
            "{}/{}/state",
            self.state_topic_prefix, consolidated.point
        ))
        .map_err(|err| HandlerError::Failed(err.to_string()))?;
        let payload = serde_json::to_vec(&consolidated.state_payload())?;
        let report = publisher.publish(Envelope::new(topic, payload).with_qos(QoS::AtLeastOnce));
        debug!("Point state delivered to {} subscribers", report.delivered);

        self.gateway
            .insert(&self.record_kind, &consolidated.record())?;
        Ok(())
    }
}
