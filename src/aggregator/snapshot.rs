//! The conveyor snapshot and its record mapping.
//!
//! Each [`Field`] owns one column of the persisted record; the column names
//! are part of the contract with the persistence backend and must not change.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::Record;

/// How raw payloads of a field are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    /// A point number, written either bare (`3`) or as an id (`O3`).
    Point,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    La1Forward,
    La1Backward,
    La2Forward,
    La2Backward,
    Stepper1Relay,
    Stepper2Relay,
    IrRelay,
    InductiveRelay,
    CapacitiveRelay,
    IrSensor,
    InductiveSensor,
    CapacitiveSensor,
    Stepper1Rpm,
    Stepper1Pos,
    Stepper2Rpm,
    Stepper2Pos,
    IsPowerLive,
    InnerPoint1Occupied,
    InnerPoint2Occupied,
    InnerPoint3Occupied,
    InnerPoint4Occupied,
    InnerPoint5Occupied,
    PointId,
}

pub const FIELD_COUNT: usize = 23;

/// Number of outer points tracked by the rig.
pub const OUTER_POINTS: usize = 5;

impl Field {
    /// Every field, in record column order.
    pub const ALL: [Field; FIELD_COUNT] = [
        Field::La1Forward,
        Field::La1Backward,
        Field::La2Forward,
        Field::La2Backward,
        Field::Stepper1Relay,
        Field::Stepper2Relay,
        Field::IrRelay,
        Field::InductiveRelay,
        Field::CapacitiveRelay,
        Field::IrSensor,
        Field::InductiveSensor,
        Field::CapacitiveSensor,
        Field::Stepper1Rpm,
        Field::Stepper1Pos,
        Field::Stepper2Rpm,
        Field::Stepper2Pos,
        Field::IsPowerLive,
        Field::InnerPoint1Occupied,
        Field::InnerPoint2Occupied,
        Field::InnerPoint3Occupied,
        Field::InnerPoint4Occupied,
        Field::InnerPoint5Occupied,
        Field::PointId,
    ];

    /// Column name in the persisted record.
    pub fn column(self) -> &'static str {
        match self {
            Field::La1Forward => "la1_forward",
            Field::La1Backward => "la1_backward",
            Field::La2Forward => "la2_forward",
            Field::La2Backward => "la2_backward",
            Field::Stepper1Relay => "stepper1_relay",
            Field::Stepper2Relay => "stepper2_relay",
            Field::IrRelay => "ir_relay",
            Field::InductiveRelay => "inductive_relay",
            Field::CapacitiveRelay => "capacitive_relay",
            Field::IrSensor => "ir_sensor",
            Field::InductiveSensor => "inductive_sensor",
            Field::CapacitiveSensor => "capacitive_sensor",
            Field::Stepper1Rpm => "stepper1_rpm",
            Field::Stepper1Pos => "stepper1_pos",
            Field::Stepper2Rpm => "stepper2_rpm",
            Field::Stepper2Pos => "stepper2_pos",
            Field::IsPowerLive => "is_power_live",
            Field::InnerPoint1Occupied => "inner_point_1_occupied",
            Field::InnerPoint2Occupied => "inner_point_2_occupied",
            Field::InnerPoint3Occupied => "inner_point_3_occupied",
            Field::InnerPoint4Occupied => "inner_point_4_occupied",
            Field::InnerPoint5Occupied => "inner_point_5_occupied",
            Field::PointId => "point_id",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Field::Stepper1Rpm | Field::Stepper1Pos | Field::Stepper2Rpm | Field::Stepper2Pos => {
                FieldKind::Int
            }
            Field::PointId => FieldKind::Point,
            _ => FieldKind::Bool,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// A decoded field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
}

impl FieldValue {
    fn zero(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::Int | FieldKind::Point => FieldValue::Int(0),
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            FieldValue::Bool(value) => value,
            FieldValue::Int(value) => value != 0,
        }
    }

    pub fn as_int(self) -> i64 {
        match self {
            FieldValue::Bool(value) => i64::from(value),
            FieldValue::Int(value) => value,
        }
    }
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Bool(value) => Value::Bool(value),
            FieldValue::Int(value) => Value::from(value),
        }
    }
}

/// Classification of an outer point by the proximity sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    #[default]
    Empty,
    OccupiedNonMetallic,
    OccupiedMetallic,
}

impl Occupancy {
    /// Something is present when the IR or the capacitive sensor fires; it is
    /// metallic when the inductive sensor fires as well.
    pub fn classify(ir: bool, inductive: bool, capacitive: bool) -> Self {
        match (ir || capacitive, inductive) {
            (false, _) => Occupancy::Empty,
            (true, false) => Occupancy::OccupiedNonMetallic,
            (true, true) => Occupancy::OccupiedMetallic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Occupancy::Empty => "empty",
            Occupancy::OccupiedNonMetallic => "occupied_non_metallic",
            Occupancy::OccupiedMetallic => "occupied_metallic",
        }
    }
}

impl fmt::Display for Occupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of the rig. Starts zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    values: [FieldValue; FIELD_COUNT],
    outer_points: [Occupancy; OUTER_POINTS],
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            values: Field::ALL.map(|field| FieldValue::zero(field.kind())),
            outer_points: [Occupancy::Empty; OUTER_POINTS],
        }
    }
}

impl Snapshot {
    pub fn get(&self, field: Field) -> FieldValue {
        self.values[field.index()]
    }

    pub fn bool(&self, field: Field) -> bool {
        self.get(field).as_bool()
    }

    pub fn int(&self, field: Field) -> i64 {
        self.get(field).as_int()
    }

    /// Store `value`, returning whether the field changed.
    pub fn set(&mut self, field: Field, value: FieldValue) -> bool {
        let slot = &mut self.values[field.index()];
        if *slot == value {
            return false;
        }
        *slot = value;
        true
    }

    /// Classification of whatever sits in front of the sensors right now.
    pub fn occupancy(&self) -> Occupancy {
        Occupancy::classify(
            self.bool(Field::IrSensor),
            self.bool(Field::InductiveSensor),
            self.bool(Field::CapacitiveSensor),
        )
    }

    /// Last classification recorded for outer point `point` (1-based).
    pub fn outer_point(&self, point: i64) -> Option<Occupancy> {
        let index = usize::try_from(point).ok()?.checked_sub(1)?;
        self.outer_points.get(index).copied()
    }

    /// Record `occupancy` for outer point `point`; points out of range are ignored.
    pub fn set_outer_point(&mut self, point: i64, occupancy: Occupancy) -> bool {
        let slot = usize::try_from(point)
            .ok()
            .and_then(|point| point.checked_sub(1))
            .and_then(|index| self.outer_points.get_mut(index));
        match slot {
            Some(slot) => {
                *slot = occupancy;
                true
            }
            None => false,
        }
    }

    /// Flatten into the persisted record: every field column followed by
    /// `outer_point_1` .. `outer_point_5`.
    pub fn to_record(&self) -> Record {
        let mut record = Record::new();
        for field in Field::ALL {
            record.insert(field.column().to_string(), self.get(field).into());
        }
        for (index, occupancy) in self.outer_points.iter().enumerate() {
            record.insert(
                format!("outer_point_{}", index + 1),
                Value::String(occupancy.as_str().to_string()),
            );
        }
        record
    }
}
