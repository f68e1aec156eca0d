use crate::broker::{Broker, QoS};
use crate::config::BrokerSettings;
use crate::transport::codec::{
    ConnAck, Connect, ConnectReturnCode, LastWill, MqttCodec, Packet, Publish, Subscribe,
    SubscribeFilter, SubscribeReturnCode, Unsubscribe,
};
use crate::transport::{serve_tcp, serve_websocket};
use crate::utils::error::CodecError;

use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tungstenite::client::IntoClientRequest;
use tungstenite::protocol::Message as WsMessage;

type MqttStream = Framed<TcpStream, MqttCodec>;

fn encode(packet: Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    MqttCodec::default().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_all(buf: &mut BytesMut) -> Vec<Packet> {
    let mut codec = MqttCodec::default();
    let mut packets = Vec::new();
    while let Some(packet) = codec.decode(buf).unwrap() {
        packets.push(packet);
    }
    packets
}

#[test]
fn test_connect_round_trip_with_will() {
    let mut connect = Connect::new("plc-1", 30);
    connect.will = Some(LastWill {
        topic: "conveyor/status".into(),
        message: "offline".into(),
        qos: QoS::AtLeastOnce,
        retain: true,
    });
    connect.username = Some("rig".into());

    let mut buf = encode(Packet::Connect(connect.clone()));
    assert_eq!(decode_all(&mut buf), vec![Packet::Connect(connect)]);
    assert!(buf.is_empty());
}

#[test]
fn test_decode_waits_for_complete_packet() {
    let publish = Publish::new("sensor/ir/state", "1").with_qos(QoS::AtLeastOnce, Some(7));
    let full = encode(Packet::Publish(publish.clone()));

    let mut codec = MqttCodec::default();
    let mut buf = BytesMut::from(&full[..3]);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);

    buf.extend_from_slice(&full[3..]);
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::Publish(publish)));
}

#[test]
fn test_decode_several_packets_from_one_buffer() {
    let mut buf = encode(Packet::PingReq);
    buf.extend_from_slice(&encode(Packet::PubAck(3)));
    buf.extend_from_slice(&encode(Packet::Disconnect));

    assert_eq!(
        decode_all(&mut buf),
        vec![Packet::PingReq, Packet::PubAck(3), Packet::Disconnect]
    );
}

#[test]
fn test_large_payload_uses_multi_byte_length() {
    let payload = vec![b'x'; 20_000];
    let publish = Publish::new("bulk", payload);
    let mut buf = encode(Packet::Publish(publish.clone()));
    assert_eq!(buf[1] & 0x80, 0x80);
    assert_eq!(decode_all(&mut buf), vec![Packet::Publish(publish)]);
}

#[test]
fn test_oversized_packet_is_rejected() {
    let mut buf = encode(Packet::Publish(Publish::new("bulk", vec![0u8; 512])));
    let err = MqttCodec::new(128).decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::PacketTooLarge { max: 128, .. }));
}

#[test]
fn test_exactly_once_is_unsupported() {
    let mut buf = BytesMut::new();
    buf.put_u8(0x34); // PUBLISH, QoS 2
    buf.put_u8(6);
    buf.put_u16(1);
    buf.put_u8(b'a');
    buf.put_u16(1);
    buf.put_u8(b'x');
    let err = MqttCodec::default().decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::ExactlyOnceUnsupported));

    let mut buf = BytesMut::from(&[0x50u8, 0x02, 0x00, 0x01][..]); // PUBREC
    let err = MqttCodec::default().decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::Unsupported(5)));
}

#[test]
fn test_subscribe_flags_are_checked() {
    let mut buf = BytesMut::from(&[0x80u8, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00][..]);
    let err = MqttCodec::default().decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::InvalidFlags { packet_type: 8, .. }));
}

#[test]
fn test_malformed_remaining_length() {
    let mut buf = BytesMut::from(&[0x30u8, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
    let err = MqttCodec::default().decode(&mut buf).unwrap_err();
    assert!(matches!(err, CodecError::MalformedLength));
}

#[test]
fn test_suback_failure_code() {
    let suback = Packet::SubAck(crate::transport::codec::SubAck {
        packet_id: 9,
        return_codes: vec![
            SubscribeReturnCode::Success(QoS::AtLeastOnce),
            SubscribeReturnCode::Failure,
        ],
    });
    let mut buf = encode(suback.clone());
    assert_eq!(&buf[4..], &[0x01, 0x80]);
    assert_eq!(decode_all(&mut buf), vec![suback]);
}

async fn start_broker(settings: BrokerSettings) -> (Arc<Broker>, SocketAddr) {
    let broker = Arc::new(Broker::with_settings(settings));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_tcp(listener, broker.clone()));
    (broker, addr)
}

async fn recv(stream: &mut MqttStream) -> Packet {
    timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for packet")
        .expect("connection closed")
        .expect("decode failed")
}

async fn connect_with(addr: SocketAddr, connect: Connect) -> (MqttStream, ConnAck) {
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream = Framed::new(socket, MqttCodec::default());
    stream.send(Packet::Connect(connect)).await.unwrap();
    match recv(&mut stream).await {
        Packet::ConnAck(ack) => (stream, ack),
        other => panic!("expected CONNACK, got {other:?}"),
    }
}

async fn connect(addr: SocketAddr, id: &str) -> MqttStream {
    let (stream, ack) = connect_with(addr, Connect::new(id, 30)).await;
    assert_eq!(ack.code, ConnectReturnCode::Accepted);
    stream
}

async fn subscribe(stream: &mut MqttStream, filter: &str, qos: u8) -> SubscribeReturnCode {
    stream
        .send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![SubscribeFilter {
                filter: filter.into(),
                requested_qos: qos,
            }],
        }))
        .await
        .unwrap();
    match recv(stream).await {
        Packet::SubAck(ack) => ack.return_codes[0],
        other => panic!("expected SUBACK, got {other:?}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_publish_reaches_subscriber_over_tcp() {
    let (_broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut subscriber = connect(addr, "hmi").await;
    assert_eq!(
        subscribe(&mut subscriber, "sensor/#", 0).await,
        SubscribeReturnCode::Success(QoS::AtMostOnce)
    );

    let mut device = connect(addr, "plc").await;
    device
        .send(Packet::Publish(Publish::new("sensor/ir/state", "1")))
        .await
        .unwrap();

    match recv(&mut subscriber).await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "sensor/ir/state");
            assert_eq!(&publish.payload[..], b"1");
            assert_eq!(publish.qos, QoS::AtMostOnce);
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_qos1_is_acknowledged_both_ways() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut subscriber = connect(addr, "hmi").await;
    assert_eq!(
        subscribe(&mut subscriber, "cmd/+", 2).await,
        SubscribeReturnCode::Success(QoS::AtLeastOnce)
    );

    let mut device = connect(addr, "plc").await;
    device
        .send(Packet::Publish(
            Publish::new("cmd/start", "go").with_qos(QoS::AtLeastOnce, Some(42)),
        ))
        .await
        .unwrap();
    assert_eq!(recv(&mut device).await, Packet::PubAck(42));

    let packet_id = match recv(&mut subscriber).await {
        Packet::Publish(publish) => {
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            publish.packet_id.unwrap()
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    };
    subscriber.send(Packet::PubAck(packet_id)).await.unwrap();
    subscriber.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut subscriber).await, Packet::PingResp);
    assert!(broker.is_connected("hmi"));
}

#[tokio::test]
async fn test_unsupported_protocol_is_refused() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut connect = Connect::new("old", 30);
    connect.protocol_level = 5;
    let (_stream, ack) = connect_with(addr, connect).await;
    assert_eq!(ack.code, ConnectReturnCode::UnacceptableProtocolVersion);
    assert!(!broker.is_connected("old"));
}

#[tokio::test]
async fn test_full_broker_refuses_new_clients() {
    let settings = BrokerSettings {
        max_connections: 1,
        ..BrokerSettings::default()
    };
    let (_broker, addr) = start_broker(settings).await;

    let _first = connect(addr, "first").await;
    let (_stream, ack) = connect_with(addr, Connect::new("second", 30)).await;
    assert_eq!(ack.code, ConnectReturnCode::ServerUnavailable);
}

#[tokio::test]
async fn test_empty_client_id_gets_generated_id() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;
    let _stream = connect(addr, "").await;
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn test_packet_before_connect_closes_connection() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream = Framed::new(socket, MqttCodec::default());
    stream.send(Packet::PingReq).await.unwrap();

    let next = timeout(Duration::from_secs(2), stream.next()).await.unwrap();
    assert!(next.is_none() || next.unwrap().is_err());
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_will_published_on_ungraceful_disconnect() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut watcher = connect(addr, "watcher").await;
    subscribe(&mut watcher, "status/#", 0).await;

    let mut connect = Connect::new("plc", 30);
    connect.will = Some(LastWill {
        topic: "status/plc".into(),
        message: "offline".into(),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let (device, _) = connect_with(addr, connect).await;
    drop(device);

    match recv(&mut watcher).await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "status/plc");
            assert_eq!(&publish.payload[..], b"offline");
        }
        other => panic!("expected will, got {other:?}"),
    }
    wait_until(|| !broker.is_connected("plc")).await;
}

#[tokio::test]
async fn test_no_will_after_disconnect_packet() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut watcher = connect(addr, "watcher").await;
    subscribe(&mut watcher, "status/#", 0).await;

    let mut connect = Connect::new("plc", 30);
    connect.will = Some(LastWill {
        topic: "status/plc".into(),
        message: "offline".into(),
        qos: QoS::AtMostOnce,
        retain: false,
    });
    let (mut device, _) = connect_with(addr, connect).await;
    device.send(Packet::Disconnect).await.unwrap();
    wait_until(|| !broker.is_connected("plc")).await;

    watcher.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut watcher).await, Packet::PingResp);
}

#[tokio::test]
async fn test_retained_message_replayed_after_suback() {
    let (_broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut device = connect(addr, "plc").await;
    device
        .send(Packet::Publish(
            Publish::new("conveyor/mode", "auto").with_retain(true),
        ))
        .await
        .unwrap();
    device.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut device).await, Packet::PingResp);

    let mut late = connect(addr, "late").await;
    subscribe(&mut late, "conveyor/+", 0).await;
    match recv(&mut late).await {
        Packet::Publish(publish) => {
            assert!(publish.retain);
            assert_eq!(&publish.payload[..], b"auto");
        }
        other => panic!("expected retained publish, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_client_id_evicts_previous_connection() {
    let (broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut first = connect(addr, "hmi").await;
    subscribe(&mut first, "a/#", 0).await;
    let _second = connect(addr, "hmi").await;

    let next = timeout(Duration::from_secs(2), first.next()).await.unwrap();
    assert!(next.is_none() || next.unwrap().is_err());
    assert!(broker.is_connected("hmi"));
    assert_eq!(broker.session_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (_broker, addr) = start_broker(BrokerSettings::default()).await;

    let mut subscriber = connect(addr, "hmi").await;
    subscribe(&mut subscriber, "a/b", 0).await;
    subscriber
        .send(Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["a/b".into()],
        }))
        .await
        .unwrap();
    assert_eq!(recv(&mut subscriber).await, Packet::UnsubAck(2));

    let mut device = connect(addr, "plc").await;
    device
        .send(Packet::Publish(Publish::new("a/b", "x")))
        .await
        .unwrap();

    subscriber.send(Packet::PingReq).await.unwrap();
    assert_eq!(recv(&mut subscriber).await, Packet::PingResp);
}

#[tokio::test]
async fn test_invalid_filter_gets_failure_code() {
    let (_broker, addr) = start_broker(BrokerSettings::default()).await;
    let mut subscriber = connect(addr, "hmi").await;
    assert_eq!(
        subscribe(&mut subscriber, "a/#/b", 0).await,
        SubscribeReturnCode::Failure
    );
}

#[tokio::test]
async fn test_websocket_client_exchanges_mqtt() {
    let broker = Arc::new(Broker::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve_websocket(listener, broker.clone()));

    let mut request = format!("ws://{addr}/mqtt").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "mqtt".parse().unwrap());
    let (mut ws, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get("Sec-WebSocket-Protocol").unwrap(),
        "mqtt"
    );

    ws.send(WsMessage::Binary(encode(Packet::Connect(Connect::new("browser", 0))).freeze()))
        .await
        .unwrap();
    // Subscribe and publish in one frame.
    let mut frame = encode(Packet::Subscribe(Subscribe {
        packet_id: 5,
        filters: vec![SubscribeFilter {
            filter: "hmi/#".into(),
            requested_qos: 0,
        }],
    }));
    frame.extend_from_slice(&encode(Packet::Publish(Publish::new("hmi/la1/forward", "1"))));
    ws.send(WsMessage::Binary(frame.freeze())).await.unwrap();

    let mut buffer = BytesMut::new();
    let mut packets = Vec::new();
    while packets.len() < 3 {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let WsMessage::Binary(data) = message {
            buffer.extend_from_slice(&data);
            packets.extend(decode_all(&mut buffer));
        }
    }

    assert!(matches!(
        packets[0],
        Packet::ConnAck(ConnAck {
            code: ConnectReturnCode::Accepted,
            ..
        })
    ));
    assert!(matches!(&packets[1], Packet::SubAck(ack) if ack.packet_id == 5));
    assert!(matches!(&packets[2], Packet::Publish(publish) if publish.topic == "hmi/la1/forward"));
    assert!(broker.is_connected("browser"));
}
