//! # RigBroker
//!
//! `rigbroker` is an MQTT 3.1.1 broker for an industrial conveyor rig. PLCs,
//! sensors and HMI panels connect over plain TCP or over WebSocket; the broker
//! routes their publishes, folds raw sensor traffic into a consolidated rig
//! state, and relays commands and telemetry to an upstream (campus) broker.
//!
//! ## Core Modules
//!
//! - `broker`: Sessions, the topic matcher, QoS 1 tracking, retained messages
//!   and the topic handlers run for every publish.
//! - `client`: The broker-side handle of a connected client.
//! - `transport`: The MQTT codec, the TCP and WebSocket listeners and the
//!   per-connection protocol driver.
//! - `aggregator`: The rig state snapshot and the handler consolidating it per
//!   outer point.
//! - `bridge`: The upstream connection with reconnect/backoff and the
//!   forwarder sending local commands upstream.
//! - `persistence`: Where consolidated records go: the log or an embedded
//!   sled database.
//! - `config`: Loading and validating settings from file and environment.
//! - `utils`: Error types and logging setup.

pub mod aggregator;
pub mod bridge;
pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
