use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{Envelope, Origin, Publisher, TopicFilter, TopicHandler};
use crate::config::RecordRoute;
use crate::persistence::{PersistenceGateway, Record};
use crate::utils::error::{ConfigurationError, HandlerError};

/// Stores every JSON publish under its filter as a record of one kind.
///
/// An object payload becomes the record as is; any other JSON value is stored
/// as `{"value": ...}`. Payloads that are not JSON are skipped with a warning.
pub struct RecordHandler {
    interest: TopicFilter,
    kind: String,
    gateway: Arc<dyn PersistenceGateway>,
}

impl RecordHandler {
    pub fn new(
        interest: TopicFilter,
        kind: impl Into<String>,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            interest,
            kind: kind.into(),
            gateway,
        }
    }

    pub fn from_route(
        route: &RecordRoute,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Self, ConfigurationError> {
        let interest =
            TopicFilter::new(route.filter.as_str()).map_err(|source| ConfigurationError::Topic {
                key: "persistence.routes.filter",
                source,
            })?;
        Ok(Self::new(interest, route.kind.as_str(), gateway))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

pub fn to_record(value: Value) -> Record {
    match value {
        Value::Object(record) => record,
        other => Record::from_iter([("value".to_string(), other)]),
    }
}

impl TopicHandler for RecordHandler {
    fn name(&self) -> &str {
        "recorder"
    }

    fn interest(&self) -> &TopicFilter {
        &self.interest
    }

    fn handle(
        &self,
        envelope: &Envelope,
        _origin: &Origin,
        _publisher: &Publisher<'_>,
    ) -> Result<(), HandlerError> {
        let value: Value = match serde_json::from_slice(&envelope.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("[{}] '{}' is not JSON: {e}", self.kind, envelope.topic);
                return Ok(());
            }
        };

        self.gateway.insert(&self.kind, &to_record(value))?;
        debug!("[{}] stored publish on '{}'", self.kind, envelope.topic);
        Ok(())
    }
}
