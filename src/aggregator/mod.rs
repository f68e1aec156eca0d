//! The `aggregator` module reduces the stream of raw per-sensor updates into
//! a single conveyor [`Snapshot`].
//!
//! [`StateAggregator`] is the only writer of the snapshot. Whenever the
//! configured [`TriggerPolicy`] fires it hands out a [`Consolidation`]: an
//! owned copy of the snapshot taken right after the mutation. That copy is
//! what gets persisted and published, so readers never observe a snapshot
//! that is being modified.

pub mod handler;
pub mod snapshot;
pub mod table;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::persistence::Record;

pub use handler::AggregatorHandler;
pub use snapshot::{Field, FieldKind, FieldValue, Occupancy, Snapshot};
pub use table::{decode_bool, decode_int, encode_bool};

/// When a change of the snapshot produces a consolidated record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Every field change.
    AnyChange,
    /// Only a change of the rig position (`point_id`).
    #[default]
    PositionChange,
}

impl TriggerPolicy {
    fn fires(self, field: Field) -> bool {
        match self {
            TriggerPolicy::AnyChange => true,
            TriggerPolicy::PositionChange => field == Field::PointId,
        }
    }
}

/// Snapshot copy emitted when the trigger policy fires.
#[derive(Debug, Clone, PartialEq)]
pub struct Consolidation {
    pub point: i64,
    pub state: Occupancy,
    pub snapshot: Snapshot,
    pub timestamp: DateTime<Utc>,
}

impl Consolidation {
    pub fn point_id(&self) -> String {
        format!("O{}", self.point)
    }

    pub fn record(&self) -> Record {
        self.snapshot.to_record()
    }

    /// Payload published on the point state topic.
    pub fn state_payload(&self) -> serde_json::Value {
        json!({
            "point_id": self.point_id(),
            "state": self.state,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// Result of one raw update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    /// Field the topic mapped to; `None` when the topic is not a rig field.
    pub field: Option<Field>,
    pub changed: bool,
    pub consolidated: Option<Consolidation>,
}

#[derive(Debug, Default)]
pub struct StateAggregator {
    snapshot: Snapshot,
    trigger: TriggerPolicy,
}

impl StateAggregator {
    pub fn new(trigger: TriggerPolicy) -> Self {
        Self {
            snapshot: Snapshot::default(),
            trigger,
        }
    }

    pub fn trigger(&self) -> TriggerPolicy {
        self.trigger
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Decode `raw` into the field selected by `topic` and apply it.
    ///
    /// Unknown topics and undecodable payloads never fail: the former are
    /// ignored, the latter decode to `false`/`0`.
    pub fn apply_raw_update(&mut self, topic: &str, raw: &str) -> Update {
        let Some(field) = table::lookup(topic) else {
            return Update::default();
        };

        let value = table::decode(field.kind(), raw);
        let changed = self.snapshot.set(field, value);
        debug!("Aggregator: {field} <- {value:?} (changed: {changed})");

        let consolidated = (changed && self.trigger.fires(field)).then(|| self.consolidate());
        Update {
            field: Some(field),
            changed,
            consolidated,
        }
    }

    fn consolidate(&mut self) -> Consolidation {
        let point = self.snapshot.int(Field::PointId);
        let state = self.snapshot.occupancy();
        self.snapshot.set_outer_point(point, state);
        Consolidation {
            point,
            state,
            snapshot: self.snapshot.clone(),
            timestamp: Utc::now(),
        }
    }
}
