use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::persistence::{PersistenceGateway, Record};
use crate::utils::error::PersistenceError;

/// One record as stored on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub kind: String,
    pub record: Record,
    /// Milliseconds since the UNIX epoch.
    pub stored_at: i64,
}

/// Stores records in one sled tree per record kind.
///
/// Keys are the big-endian insert timestamp followed by a sled-generated id,
/// so a tree iterates in insertion order and old records form a key prefix
/// range that can be pruned cheaply.
#[derive(Clone)]
pub struct SledGateway {
    db: Db,
    retention_secs: Option<i64>,
}

impl SledGateway {
    pub fn open(path: &str, retention_secs: Option<i64>) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Ok(Self { db, retention_secs })
    }

    fn key(&self, stored_at: i64) -> Result<[u8; 16], PersistenceError> {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&stored_at.to_be_bytes());
        key[8..].copy_from_slice(&self.db.generate_id()?.to_be_bytes());
        Ok(key)
    }

    pub fn load_records(&self, kind: &str) -> Result<Vec<StoredRecord>, PersistenceError> {
        let tree = self.db.open_tree(kind)?;
        let mut records = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    fn cleanup_old_records(&self, tree: &Tree) -> Result<usize, PersistenceError> {
        let Some(ttl) = self.retention_secs.filter(|ttl| *ttl > 0) else {
            return Ok(0);
        };
        // A retention reaching past the epoch expires nothing.
        let Some(expiry_time) = ttl
            .checked_mul(1000)
            .map(|ttl_ms| Utc::now().timestamp_millis().saturating_sub(ttl_ms))
            .filter(|expiry| *expiry > 0)
        else {
            return Ok(0);
        };

        let old_keys = tree
            .range(..expiry_time.to_be_bytes())
            .keys()
            .collect::<Result<Vec<_>, _>>()?;
        for key in &old_keys {
            tree.remove(key)?;
        }
        Ok(old_keys.len())
    }
}

impl PersistenceGateway for SledGateway {
    fn insert(&self, kind: &str, record: &Record) -> Result<(), PersistenceError> {
        let stored = StoredRecord {
            kind: kind.to_string(),
            record: record.clone(),
            stored_at: Utc::now().timestamp_millis(),
        };

        let tree = self.db.open_tree(kind)?;
        tree.insert(self.key(stored.stored_at)?, serde_json::to_vec(&stored)?)?;

        let pruned = self.cleanup_old_records(&tree)?;
        if pruned > 0 {
            tracing::debug!("Pruned {pruned} expired {kind} records");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SledGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledGateway")
            .field("db", &"sled::Db")
            .field("retention_secs", &self.retention_secs)
            .finish()
    }
}
