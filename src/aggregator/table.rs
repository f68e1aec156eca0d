//! Topic → field dispatch and payload decoding.
//!
//! A raw update is routed by the suffix of its topic. Suffixes are compared on
//! segment boundaries (`rig/ir/state` ends with `ir/state`, `rig/air/state`
//! does not) and tried in table order; the first entry that matches wins.
//! After the table, the column name of every field is accepted as a final
//! segment (`conveyor/raw/ir_sensor`), again in column order.

use std::borrow::Cow;

use serde_json::Value;

use super::snapshot::{Field, FieldKind, FieldValue};

const FIELD_TABLE: &[(&str, Field)] = &[
    ("la1/forward", Field::La1Forward),
    ("la1/backward", Field::La1Backward),
    ("la2/forward", Field::La2Forward),
    ("la2/backward", Field::La2Backward),
    ("stepper1/relay", Field::Stepper1Relay),
    ("stepper2/relay", Field::Stepper2Relay),
    ("ir/relay", Field::IrRelay),
    ("inductive/relay", Field::InductiveRelay),
    ("capacitive/relay", Field::CapacitiveRelay),
    ("ir/state", Field::IrSensor),
    ("ir/sensor", Field::IrSensor),
    ("inductive/state", Field::InductiveSensor),
    ("inductive/sensor", Field::InductiveSensor),
    ("capacitive/state", Field::CapacitiveSensor),
    ("capacitive/sensor", Field::CapacitiveSensor),
    ("stepper1/rpm", Field::Stepper1Rpm),
    ("stepper1/position", Field::Stepper1Pos),
    ("stepper1_position", Field::Stepper1Pos),
    ("stepper2/rpm", Field::Stepper2Rpm),
    ("stepper2/position", Field::Stepper2Pos),
    ("stepper2_position", Field::Stepper2Pos),
    ("power/live", Field::IsPowerLive),
    ("inner/point/1/occupied", Field::InnerPoint1Occupied),
    ("inner/point/2/occupied", Field::InnerPoint2Occupied),
    ("inner/point/3/occupied", Field::InnerPoint3Occupied),
    ("inner/point/4/occupied", Field::InnerPoint4Occupied),
    ("inner/point/5/occupied", Field::InnerPoint5Occupied),
    ("point/position", Field::PointId),
];

fn ends_with_segments(topic: &str, suffix: &str) -> bool {
    match topic.strip_suffix(suffix) {
        Some("") => true,
        Some(rest) => rest.ends_with('/'),
        None => false,
    }
}

/// Field updated by a publish on `topic`, if any.
pub fn lookup(topic: &str) -> Option<Field> {
    FIELD_TABLE
        .iter()
        .find(|(suffix, _)| ends_with_segments(topic, suffix))
        .map(|(_, field)| *field)
        .or_else(|| {
            Field::ALL
                .into_iter()
                .find(|field| ends_with_segments(topic, field.column()))
        })
}

/// Payloads are either a bare value or a JSON object carrying it under `value`.
pub fn raw_value(raw: &str) -> Cow<'_, str> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return Cow::Borrowed(trimmed);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(object)) => match object.get("value") {
            Some(Value::String(value)) => Cow::Owned(value.trim().to_string()),
            Some(Value::Bool(value)) => Cow::Borrowed(encode_bool(*value)),
            Some(Value::Number(value)) => Cow::Owned(value.to_string()),
            _ => Cow::Borrowed(""),
        },
        _ => Cow::Borrowed(trimmed),
    }
}

/// `1`, `true` and `on` (any case) are true; everything else is false.
pub fn decode_bool(raw: &str) -> bool {
    let value = raw.trim();
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("on")
}

pub fn encode_bool(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// Integers, or floats truncated toward zero. Anything else is 0.
pub fn decode_int(raw: &str) -> i64 {
    let value = raw.trim();
    value
        .parse::<i64>()
        .ok()
        .or_else(|| {
            value
                .parse::<f64>()
                .ok()
                .filter(|float| float.is_finite())
                .map(|float| float as i64)
        })
        .unwrap_or(0)
}

/// Point ids are `O3` or plain `3`.
pub fn decode_point(raw: &str) -> i64 {
    let value = raw.trim();
    let value = value
        .strip_prefix('O')
        .or_else(|| value.strip_prefix('o'))
        .unwrap_or(value);
    decode_int(value)
}

pub fn decode(kind: FieldKind, raw: &str) -> FieldValue {
    let value = raw_value(raw);
    match kind {
        FieldKind::Bool => FieldValue::Bool(decode_bool(&value)),
        FieldKind::Int => FieldValue::Int(decode_int(&value)),
        FieldKind::Point => FieldValue::Int(decode_point(&value)),
    }
}
