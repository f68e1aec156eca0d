//! The `persistence` module is the gateway between the broker and durable
//! storage of consolidated records.
//!
//! The broker only depends on the [`PersistenceGateway`] trait: a record kind
//! plus a flat field → value mapping. Inserts are attempted once; a failure is
//! reported to the caller, which logs it. Nothing is retried.
//!
//! Two backends exist: [`LogGateway`], which only logs the records, and
//! [`sled_store::SledGateway`], which keeps them in an embedded `sled`
//! database. Besides the aggregator, configured routes store JSON publishes
//! directly through a [`RecordHandler`].

pub mod recorder;
pub mod sled_store;

use std::sync::Arc;

use tracing::info;

use crate::config::{PersistenceBackend, PersistenceSettings};
use crate::utils::error::{ConfigurationError, PersistenceError};

pub use recorder::RecordHandler;
pub use sled_store::{SledGateway, StoredRecord};

/// A flat record: column name → JSON scalar.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub trait PersistenceGateway: Send + Sync {
    fn insert(&self, kind: &str, record: &Record) -> Result<(), PersistenceError>;
}

/// Gateway used when no storage backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGateway;

impl PersistenceGateway for LogGateway {
    fn insert(&self, kind: &str, record: &Record) -> Result<(), PersistenceError> {
        info!("[{kind}] {}", serde_json::to_string(record)?);
        Ok(())
    }
}

/// Build the gateway selected by configuration.
pub fn open_gateway(
    settings: &PersistenceSettings,
) -> Result<Arc<dyn PersistenceGateway>, ConfigurationError> {
    match settings.backend {
        PersistenceBackend::None => Ok(Arc::new(LogGateway)),
        PersistenceBackend::Sled => {
            let path = settings
                .path
                .as_deref()
                .filter(|path| !path.trim().is_empty())
                .ok_or(ConfigurationError::Invalid {
                    key: "persistence.path",
                    reason: "required by the sled backend".to_string(),
                })?;
            let gateway = SledGateway::open(path, settings.retention_secs).map_err(|source| {
                ConfigurationError::Persistence {
                    path: path.to_string(),
                    source,
                }
            })?;
            info!("Persisting records to sled database at {path}");
            Ok(Arc::new(gateway))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;
