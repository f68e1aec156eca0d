use super::{
    Backoff, BridgeForwarder, BridgeState, UpstreamLink, extract_forward_value, install,
    translate_topic,
};
use crate::broker::{Broker, Envelope, Origin, QoS, TopicFilter, TopicHandler, TopicName};
use crate::client::{Client, Outgoing};
use crate::config::BridgeSettings;
use crate::transport::codec::{Connect, MqttCodec, Packet, Publish, Subscribe, SubscribeFilter};
use crate::transport::serve_tcp;

use futures_util::{SinkExt, StreamExt};
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;

type MqttStream = Framed<TcpStream, MqttCodec>;

#[test]
fn test_backoff_doubles_up_to_max() {
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
    let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
    assert_eq!(
        delays,
        [100, 200, 400, 800, 1000, 1000].map(Duration::from_millis)
    );
    assert_eq!(backoff.attempt(), 6);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_millis(100));
}

#[test]
fn test_backoff_never_overflows() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    for _ in 0..100 {
        assert!(backoff.next_delay() <= Duration::from_secs(30));
    }
}

#[test]
fn test_translate_topic() {
    let topic = TopicName::new("hmi/la1/forward").unwrap();
    assert_eq!(
        translate_topic(&topic, "hmi", "conveyor/cmd").as_deref(),
        Some("conveyor/cmd/la1/forward")
    );

    let exact = TopicName::new("hmi").unwrap();
    assert_eq!(
        translate_topic(&exact, "hmi", "conveyor/cmd").as_deref(),
        Some("conveyor/cmd")
    );

    let outside = TopicName::new("hmix/la1").unwrap();
    assert_eq!(translate_topic(&outside, "hmi", "conveyor/cmd"), None);
}

#[test]
fn test_extract_forward_value() {
    assert_eq!(
        extract_forward_value(br#"{"state": true}"#).unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(
        extract_forward_value(br#"{"state": false, "value": 9}"#)
            .unwrap()
            .as_deref(),
        Some("0")
    );
    assert_eq!(
        extract_forward_value(br#"{"value": 1500}"#).unwrap().as_deref(),
        Some("1500")
    );
    assert_eq!(
        extract_forward_value(br#"{"value": 2.5}"#).unwrap().as_deref(),
        Some("2.5")
    );
    assert_eq!(extract_forward_value(br#"{"value": "fast"}"#).unwrap(), None);
    assert_eq!(extract_forward_value(br#"{"speed": 3}"#).unwrap(), None);
    assert_eq!(extract_forward_value(b"1").unwrap(), None);
    assert!(extract_forward_value(b"{not json").is_err());
}

/// The event loop is never polled, so requests just sit in its queue. It has
/// to outlive the client: dropping it closes the request channel.
fn offline_client() -> (AsyncClient, EventLoop) {
    let options = MqttOptions::new("unit", "127.0.0.1", 1);
    AsyncClient::new(options, 16)
}

fn forwarder(link: Arc<UpstreamLink>) -> BridgeForwarder {
    BridgeForwarder::new("hmi", "conveyor/cmd", link).unwrap()
}

#[test]
fn test_forwarder_ignores_bridge_origin() {
    let broker = Broker::new();
    let link = Arc::new(UpstreamLink::new());
    let (client, _eventloop) = offline_client();
    link.attach(client);
    let forwarder = Arc::new(forwarder(link.clone()));
    broker.register_handler(forwarder.clone());

    let envelope = Envelope::new(TopicName::new("hmi/la1/forward").unwrap(), r#"{"state":true}"#);
    let report = broker.publish(envelope.clone(), Origin::Bridge);
    assert_eq!(report.handlers_invoked, 1);
    assert_eq!(link.forwarded(), 0);

    broker.publish(envelope, Origin::Client("hmi-panel".into()));
    assert_eq!(link.forwarded(), 1);
}

#[test]
fn test_forwarder_survives_bad_payloads_and_offline_link() {
    let broker = Broker::new();
    let link = Arc::new(UpstreamLink::new());
    assert_eq!(
        forwarder(link.clone()).interest(),
        &TopicFilter::new("hmi/#").unwrap()
    );
    broker.register_handler(Arc::new(forwarder(link.clone())));

    let origin = Origin::Client("hmi-panel".into());
    let topic = TopicName::new("hmi/stepper1/rpm").unwrap();

    let report = broker.publish(Envelope::new(topic.clone(), "{oops"), origin.clone());
    assert_eq!(report.handler_failures, 0);

    let report = broker.publish(Envelope::new(topic.clone(), r#"{"value": 3}"#), origin.clone());
    assert_eq!(report.handler_failures, 0);
    assert_eq!(link.forwarded(), 0);

    let (client, _eventloop) = offline_client();
    link.attach(client);
    broker.publish(Envelope::new(topic.clone(), r#"{"note": "x"}"#), origin.clone());
    assert_eq!(link.forwarded(), 0);
    broker.publish(Envelope::new(topic, r#"{"value": 3}"#), origin);
    assert_eq!(link.forwarded(), 1);

    link.detach();
    assert!(!link.is_online());
}

async fn start_upstream() -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_tcp(listener, broker.clone()));
    (broker, addr)
}

async fn recv(stream: &mut MqttStream) -> Packet {
    timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for packet")
        .expect("connection closed")
        .expect("decode failed")
}

async fn upstream_client(addr: SocketAddr, id: &str, filters: &[&str]) -> MqttStream {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream = Framed::new(socket, MqttCodec::default());
    stream
        .send(Packet::Connect(Connect::new(id, 30)))
        .await
        .unwrap();
    assert!(matches!(recv(&mut stream).await, Packet::ConnAck(_)));

    stream
        .send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: filters
                .iter()
                .map(|filter| SubscribeFilter {
                    filter: filter.to_string(),
                    requested_qos: 0,
                })
                .collect(),
        }))
        .await
        .unwrap();
    assert!(matches!(recv(&mut stream).await, Packet::SubAck(_)));
    stream
}

async fn next_publish(stream: &mut MqttStream) -> Publish {
    loop {
        if let Packet::Publish(publish) = recv(stream).await {
            return publish;
        }
    }
}

fn bridge_settings(addr: SocketAddr) -> BridgeSettings {
    BridgeSettings {
        enabled: true,
        host: addr.ip().to_string(),
        port: addr.port(),
        keep_alive_secs: 5,
        connect_timeout_secs: 2,
        backoff_initial_ms: 50,
        backoff_max_ms: 200,
        ..BridgeSettings::default()
    }
}

fn local_subscriber(broker: &Broker, id: &str, filter: &str) -> mpsc::UnboundedReceiver<Outgoing> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = broker.connect(Client::new(id, tx)).unwrap();
    broker
        .subscribe(&handle, TopicFilter::new(filter).unwrap(), QoS::AtMostOnce)
        .unwrap();
    rx
}

async fn wait_for_local(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Option<Publish> {
    match timeout(Duration::from_millis(100), rx.recv()).await {
        Ok(Some(Outgoing::Packet(Packet::Publish(publish)))) => Some(publish),
        _ => None,
    }
}

#[tokio::test]
async fn test_bridge_relays_in_both_directions() {
    let (_upstream, addr) = start_upstream().await;
    let filters = ["conveyor/cmd/#", "rigbroker/debug/#"];
    let mut campus = upstream_client(addr, "campus", &filters).await;

    let local = Arc::new(Broker::new());
    let mut hmi = local_subscriber(&local, "hmi-panel", "conveyor/raw/#");

    let connector = install(&bridge_settings(addr), local.clone()).unwrap();
    let mut state = connector.state();
    tokio::spawn(connector.run());
    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == BridgeState::Connected),
    )
    .await
    .expect("bridge did not connect")
    .unwrap();

    let heartbeat = next_publish(&mut campus).await;
    assert_eq!(heartbeat.topic, "rigbroker/debug/heartbeat");
    let heartbeat: Value = serde_json::from_slice(&heartbeat.payload).unwrap();
    assert_eq!(heartbeat["status"], "online");
    assert!(
        heartbeat["client_id"]
            .as_str()
            .unwrap()
            .starts_with("rigbroker-bridge-")
    );

    // Local command → upstream.
    local.publish(
        Envelope::new(
            TopicName::new("hmi/la1/forward").unwrap(),
            r#"{"state": true}"#,
        ),
        Origin::Client("hmi-panel".into()),
    );
    let command = next_publish(&mut campus).await;
    assert_eq!(command.topic, "conveyor/cmd/la1/forward");
    assert_eq!(&command.payload[..], b"1");

    // Upstream telemetry → local. The bridge may still be subscribing, so
    // publish until it shows up.
    let mut received = None;
    for _ in 0..50 {
        campus
            .send(Packet::Publish(Publish::new("conveyor/raw/ir_sensor", "1")))
            .await
            .unwrap();
        if let Some(publish) = wait_for_local(&mut hmi).await {
            received = Some(publish);
            break;
        }
    }
    let received = received.expect("upstream publish never reached local subscriber");
    assert_eq!(received.topic, "conveyor/raw/ir_sensor");
    assert_eq!(&received.payload[..], b"1");
}

#[tokio::test]
async fn test_forwarded_message_is_not_forwarded_again() {
    let (_upstream, addr) = start_upstream().await;

    // Outbound and upstream namespaces coincide: everything forwarded comes
    // straight back through the bridge subscription.
    let settings = BridgeSettings {
        subscribe_filter: "plant/#".into(),
        outbound_prefix: "plant".into(),
        upstream_prefix: "plant".into(),
        heartbeat_topic: None,
        ..bridge_settings(addr)
    };

    let local = Arc::new(Broker::new());
    let mut watcher = local_subscriber(&local, "watcher", "plant/#");
    let connector = install(&settings, local.clone()).unwrap();
    let link = connector.link();
    let mut state = connector.state();
    tokio::spawn(connector.run());
    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == BridgeState::Connected),
    )
    .await
    .expect("bridge did not connect")
    .unwrap();

    // Let the upstream subscription settle before publishing.
    sleep(Duration::from_millis(200)).await;
    local.publish(
        Envelope::new(TopicName::new("plant/valve").unwrap(), r#"{"value": 5}"#),
        Origin::Client("hmi-panel".into()),
    );

    // First the local copy, then the one that came back from upstream.
    let first = wait_for_local(&mut watcher).await.unwrap();
    assert_eq!(&first.payload[..], br#"{"value": 5}"#);
    let mut echoed = None;
    for _ in 0..30 {
        if let Some(publish) = wait_for_local(&mut watcher).await {
            echoed = Some(publish);
            break;
        }
    }
    assert_eq!(&echoed.expect("no echo from upstream").payload[..], b"5");

    sleep(Duration::from_millis(300)).await;
    assert_eq!(link.forwarded(), 1);
    assert!(wait_for_local(&mut watcher).await.is_none());
}

#[tokio::test]
async fn test_unreachable_upstream_goes_offline_and_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let local = Arc::new(Broker::new());
    let connector = install(&bridge_settings(addr), local.clone()).unwrap();
    let link = connector.link();
    let mut state = connector.state();
    assert_eq!(*state.borrow(), BridgeState::Disconnected);
    tokio::spawn(connector.run());

    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == BridgeState::OfflineRetrying),
    )
    .await
    .expect("bridge never went offline")
    .unwrap();
    assert!(!link.is_online());

    // Still trying after the first backoff.
    timeout(Duration::from_secs(5), state.changed())
        .await
        .expect("bridge did not retry")
        .unwrap();

    // Local publishes keep working while offline.
    let report = local.publish(
        Envelope::new(TopicName::new("hmi/la1/forward").unwrap(), r#"{"state": true}"#),
        Origin::Client("hmi-panel".into()),
    );
    assert_eq!(report.handlers_invoked, 1);
    assert_eq!(report.handler_failures, 0);
}
