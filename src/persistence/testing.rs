use std::sync::{Mutex, PoisonError};

use crate::persistence::{PersistenceGateway, Record};
use crate::utils::error::PersistenceError;

/// Gateway that keeps every insert in memory.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    inserts: Mutex<Vec<(String, Record)>>,
}

impl RecordingGateway {
    pub fn inserts(&self) -> Vec<(String, Record)> {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PersistenceGateway for RecordingGateway {
    fn insert(&self, kind: &str, record: &Record) -> Result<(), PersistenceError> {
        self.inserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind.to_string(), record.clone()));
        Ok(())
    }
}

/// Gateway whose inserts always fail.
#[derive(Debug, Default)]
pub struct FailingGateway;

impl PersistenceGateway for FailingGateway {
    fn insert(&self, _kind: &str, _record: &Record) -> Result<(), PersistenceError> {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        Err(PersistenceError::Serialization(err))
    }
}
