mod settings;

use config::{Config, Environment, File};

use crate::broker::topic::{TopicFilter, TopicName};
use crate::utils::error::ConfigurationError;

pub use settings::{
    AggregatorSettings, BridgeSettings, BrokerSettings, LoggingSettings, PersistenceBackend,
    PersistenceSettings, RecordRoute, ServerSettings, Settings,
};

/// Environment variables look like `RIGBROKER__BRIDGE__HOST`.
pub const ENV_PREFIX: &str = "RIGBROKER";
const ENV_SEPARATOR: &str = "__";

/// Loads the configuration from the default file and environment variables
/// Missing values fall back to the defaults of each section
/// Returns validated `Settings`
pub fn load_config() -> Result<Settings, ConfigurationError> {
    load_config_from(None)
}

/// Same as [`load_config`], reading `path` (which must exist) instead of
/// the optional `config/default` file.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigurationError> {
    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name("config/default").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn parse_filter(key: &'static str, value: &str) -> Result<TopicFilter, ConfigurationError> {
    TopicFilter::new(value).map_err(|source| ConfigurationError::Topic { key, source })
}

fn parse_topic(key: &'static str, value: &str) -> Result<TopicName, ConfigurationError> {
    TopicName::new(value).map_err(|source| ConfigurationError::Topic { key, source })
}

impl Settings {
    /// Checks everything that would otherwise fail later at runtime.
    /// Any error here is fatal for the process.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.server.tcp_port == 0 {
            return Err(invalid("server.tcp_port", "port 0 is not allowed"));
        }
        if self.server.ws_port == 0 {
            return Err(invalid("server.ws_port", "port 0 is not allowed"));
        }
        if self.server.tcp_port == self.server.ws_port {
            return Err(invalid(
                "server.ws_port",
                "must differ from server.tcp_port",
            ));
        }

        if self.broker.max_connections == 0 {
            return Err(invalid("broker.max_connections", "must be at least 1"));
        }
        if self.broker.max_packet_size < 64 {
            return Err(invalid("broker.max_packet_size", "must be at least 64 bytes"));
        }

        if self.persistence.backend == PersistenceBackend::Sled
            && self
                .persistence
                .path
                .as_deref()
                .is_none_or(|path| path.trim().is_empty())
        {
            return Err(invalid(
                "persistence.path",
                "required by the sled backend",
            ));
        }

        if self.persistence.retention_secs.is_some_and(|secs| secs <= 0) {
            return Err(invalid("persistence.retention_secs", "must be at least 1"));
        }

        for route in &self.persistence.routes {
            parse_filter("persistence.routes.filter", &route.filter)?;
            if route.kind.trim().is_empty() {
                return Err(invalid("persistence.routes.kind", "cannot be empty"));
            }
        }

        if self.aggregator.enabled {
            parse_filter("aggregator.topic_filter", &self.aggregator.topic_filter)?;
            parse_topic(
                "aggregator.state_topic_prefix",
                &self.aggregator.state_topic_prefix,
            )?;
            if self.aggregator.record_kind.trim().is_empty() {
                return Err(invalid("aggregator.record_kind", "cannot be empty"));
            }
        }

        if self.bridge.enabled {
            self.validate_bridge()?;
        }

        Ok(())
    }

    fn validate_bridge(&self) -> Result<(), ConfigurationError> {
        let bridge = &self.bridge;
        if bridge.host.trim().is_empty() {
            return Err(invalid("bridge.host", "required when the bridge is enabled"));
        }
        if bridge.port == 0 {
            return Err(invalid("bridge.port", "port 0 is not allowed"));
        }
        if bridge.backoff_initial_ms == 0 || bridge.backoff_initial_ms > bridge.backoff_max_ms {
            return Err(invalid(
                "bridge.backoff_initial_ms",
                "must be positive and not above bridge.backoff_max_ms",
            ));
        }
        if bridge.connect_timeout_secs == 0 {
            return Err(invalid("bridge.connect_timeout_secs", "must be at least 1"));
        }

        let subscribe = parse_filter("bridge.subscribe_filter", &bridge.subscribe_filter)?;
        parse_topic("bridge.outbound_prefix", &bridge.outbound_prefix)?;
        parse_topic("bridge.upstream_prefix", &bridge.upstream_prefix)?;
        if let Some(topic) = bridge.heartbeat_topic() {
            parse_topic("bridge.heartbeat_topic", topic)?;
        }

        let outbound = TopicFilter::namespace(&bridge.outbound_prefix).map_err(|source| {
            ConfigurationError::Topic {
                key: "bridge.outbound_prefix",
                source,
            }
        })?;
        if outbound.overlaps(&subscribe) {
            return Err(ConfigurationError::BridgeLoop {
                outbound: outbound.to_string(),
                subscribe: subscribe.to_string(),
            });
        }

        Ok(())
    }
}
