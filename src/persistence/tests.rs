use super::testing::{FailingGateway, RecordingGateway};
use super::{
    LogGateway, PersistenceGateway, Record, RecordHandler, SledGateway, StoredRecord, open_gateway,
};
use crate::broker::{Broker, Envelope, Origin, TopicName};
use crate::config::{PersistenceBackend, PersistenceSettings, RecordRoute};
use crate::utils::error::ConfigurationError;

use serde_json::{Value, json};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn create_test_gateway(retention_secs: Option<i64>) -> (TempDir, SledGateway) {
    let dir = tempdir().unwrap();
    let gateway = SledGateway::open(dir.path().to_str().unwrap(), retention_secs).unwrap();
    (dir, gateway)
}

fn record(point: i64, ir: bool) -> Record {
    let mut record = Record::new();
    record.insert("point_id".to_string(), json!(point));
    record.insert("ir_sensor".to_string(), Value::Bool(ir));
    record
}

#[test]
fn test_insert_and_load_record() {
    let (_dir, gateway) = create_test_gateway(None);

    gateway.insert("machine_logs", &record(1, true)).unwrap();
    let records = gateway.load_records("machine_logs").unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, "machine_logs");
    assert_eq!(records[0].record, record(1, true));
    assert!(records[0].stored_at > 0);
}

#[test]
fn test_records_load_in_insert_order() {
    let (_dir, gateway) = create_test_gateway(None);

    for point in 1..=4 {
        gateway.insert("machine_logs", &record(point, false)).unwrap();
    }

    let points: Vec<_> = gateway
        .load_records("machine_logs")
        .unwrap()
        .iter()
        .map(|stored| stored.record["point_id"].clone())
        .collect();
    assert_eq!(points, vec![json!(1), json!(2), json!(3), json!(4)]);
}

#[test]
fn test_kinds_are_kept_apart() {
    let (_dir, gateway) = create_test_gateway(None);

    gateway.insert("machine_logs", &record(1, true)).unwrap();
    gateway.insert("fess_data", &record(2, false)).unwrap();

    assert_eq!(gateway.load_records("machine_logs").unwrap().len(), 1);
    assert_eq!(gateway.load_records("fess_data").unwrap().len(), 1);
}

#[test]
fn test_retention_prunes_old_records() {
    let (_dir, gateway) = create_test_gateway(Some(1));

    gateway.insert("machine_logs", &record(1, true)).unwrap();
    sleep(Duration::from_millis(2100)); // let the first record expire
    gateway.insert("machine_logs", &record(2, false)).unwrap();

    let records = gateway.load_records("machine_logs").unwrap();
    assert_eq!(records.len(), 1, "expired record should be pruned");
    assert_eq!(records[0].record["point_id"], json!(2));
}

#[test]
fn test_non_positive_retention_keeps_fresh_records() {
    for retention in [0, -5] {
        let (_dir, gateway) = create_test_gateway(Some(retention));
        gateway.insert("machine_logs", &record(1, true)).unwrap();
        assert_eq!(gateway.load_records("machine_logs").unwrap().len(), 1);
    }
}

#[test]
fn test_huge_retention_keeps_everything() {
    for retention in [i64::MAX, i64::MAX / 1000] {
        let (_dir, gateway) = create_test_gateway(Some(retention));
        gateway.insert("machine_logs", &record(1, true)).unwrap();
        gateway.insert("machine_logs", &record(2, false)).unwrap();
        assert_eq!(gateway.load_records("machine_logs").unwrap().len(), 2);
    }
}

#[test]
fn test_unknown_kind_returns_empty_vec() {
    let (_dir, gateway) = create_test_gateway(None);
    assert!(gateway.load_records("nonexistent").unwrap().is_empty());
}

#[test]
fn test_stored_record_serialization() {
    let stored = StoredRecord {
        kind: "machine_logs".into(),
        record: record(3, true),
        stored_at: 1_725_000_000_000,
    };

    let data = serde_json::to_vec(&stored).unwrap();
    let parsed: StoredRecord = serde_json::from_slice(&data).unwrap();
    assert_eq!(parsed, stored);
}

#[test]
fn test_log_gateway_accepts_records() {
    assert!(LogGateway.insert("machine_logs", &record(1, true)).is_ok());
}

#[test]
fn test_open_gateway_sled_without_path_is_fatal() {
    let settings = PersistenceSettings {
        backend: PersistenceBackend::Sled,
        path: None,
        retention_secs: None,
        routes: Vec::new(),
    };
    let err = open_gateway(&settings).err().unwrap();
    assert!(matches!(err, ConfigurationError::Invalid { .. }));
}

#[test]
fn test_open_gateway_sled_stores_records() {
    let dir = tempdir().unwrap();
    let settings = PersistenceSettings {
        backend: PersistenceBackend::Sled,
        path: Some(dir.path().join("db").to_str().unwrap().to_string()),
        retention_secs: None,
        routes: Vec::new(),
    };

    let gateway = open_gateway(&settings).unwrap();
    gateway.insert("machine_logs", &record(5, false)).unwrap();
}

fn route(filter: &str, kind: &str) -> RecordRoute {
    RecordRoute {
        filter: filter.to_string(),
        kind: kind.to_string(),
    }
}

#[test]
fn test_record_handler_stores_json_publishes() {
    let broker = Broker::new();
    let gateway = Arc::new(RecordingGateway::default());
    let handler =
        RecordHandler::from_route(&route("fess/#", "fess_data"), gateway.clone()).unwrap();
    assert_eq!(handler.kind(), "fess_data");
    broker.register_handler(Arc::new(handler));

    let origin = Origin::Client("fess-station".into());
    let publish = |topic: &str, payload: &'static str| {
        broker.publish(
            Envelope::new(TopicName::new(topic).unwrap(), payload),
            origin.clone(),
        )
    };

    let report = publish("fess/station1", r#"{"pressure": 4.2, "ok": true}"#);
    assert_eq!(report.handlers_invoked, 1);
    publish("fess/station1/count", "17");
    // Not JSON: skipped without failing the handler.
    assert_eq!(publish("fess/station1", "hello").handler_failures, 0);
    publish("other/topic", r#"{"ignored": true}"#);

    let inserts = gateway.inserts();
    assert_eq!(inserts.len(), 2);
    assert_eq!(inserts[0].0, "fess_data");
    assert_eq!(inserts[0].1["pressure"], json!(4.2));
    assert_eq!(inserts[1].1["value"], json!(17));
}

#[test]
fn test_record_handler_reports_storage_failures() {
    let broker = Broker::new();
    let gateway = Arc::new(FailingGateway);
    let handler = RecordHandler::from_route(&route("fess/#", "fess_data"), gateway).unwrap();
    broker.register_handler(Arc::new(handler));

    let report = broker.publish(
        Envelope::new(TopicName::new("fess/a").unwrap(), r#"{"x": 1}"#),
        Origin::Bridge,
    );
    assert_eq!(report.handlers_invoked, 1);
    assert_eq!(report.handler_failures, 1);
}

#[test]
fn test_record_route_with_bad_filter_is_rejected() {
    let result = RecordHandler::from_route(&route("fess/#/x", "fess_data"), Arc::new(LogGateway));
    assert!(matches!(result, Err(ConfigurationError::Topic { .. })));
}
