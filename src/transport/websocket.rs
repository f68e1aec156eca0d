//! MQTT over WebSocket.
//!
//! Browsers speak MQTT in binary WebSocket frames and ask for the `mqtt`
//! subprotocol during the upgrade. A frame does not have to line up with a
//! packet, so inbound frames are fed through the same codec as the TCP
//! listener.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future, stream};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::transport::codec::{MqttCodec, Packet};
use crate::transport::connection::drive_connection;
use crate::utils::error::TransportError;

pub const SUBPROTOCOL: &str = "mqtt";
const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Accept MQTT-over-WebSocket connections until the task is dropped.
pub async fn serve_websocket(listener: TcpListener, broker: Arc<Broker>) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{addr}");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_websocket(stream, peer.to_string(), broker.clone()));
            }
            Err(e) => warn!("Failed to accept WebSocket connection: {e}"),
        }
    }
}

async fn handle_websocket(stream: TcpStream, peer: String, broker: Arc<Broker>) {
    let ws_stream = match accept_hdr_async(stream, negotiate_subprotocol).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("{peer}: WebSocket handshake error: {e}");
            return;
        }
    };

    let codec = MqttCodec::new(broker.settings().max_packet_size);
    let (ws_sender, ws_receiver) = ws_stream.split();
    drive_connection(
        packet_stream(ws_receiver, codec),
        packet_sink(ws_sender, codec),
        broker,
        peer,
    )
    .await;
}

/// Echo the `mqtt` subprotocol when the client offers it.
fn negotiate_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get(SUBPROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|protocol| protocol.trim().eq_ignore_ascii_case(SUBPROTOCOL))
        });
    if offered {
        response
            .headers_mut()
            .insert(SUBPROTOCOL_HEADER, HeaderValue::from_static(SUBPROTOCOL));
    }
    Ok(response)
}

/// Reassemble MQTT packets from binary frames.
pub fn packet_stream<S>(
    frames: S,
    codec: MqttCodec,
) -> impl Stream<Item = Result<Packet, TransportError>>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    stream::unfold(
        Some((frames, codec, BytesMut::new())),
        |state| async move {
            let Some((mut frames, mut codec, mut buffer)) = state else {
                return None;
            };
            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(packet)) => return Some((Ok(packet), Some((frames, codec, buffer)))),
                    Ok(None) => {}
                    Err(e) => return Some((Err(TransportError::from(e)), None)),
                }
                match frames.next().await {
                    Some(Ok(WsMessage::Binary(data))) => buffer.extend_from_slice(&data),
                    Some(Ok(WsMessage::Text(_))) => {
                        let reason = "text frame on an MQTT connection".into();
                        return Some((Err(TransportError::Protocol(reason)), None));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return None,
                    Some(Ok(other)) => debug!("Ignoring control frame {other:?}"),
                    Some(Err(e)) => return Some((Err(TransportError::from(e)), None)),
                }
            }
        },
    )
}

/// Encode every packet into its own binary frame.
pub fn packet_sink<K>(
    sink: K,
    codec: MqttCodec,
) -> impl Sink<Packet, Error = TransportError> + Unpin
where
    K: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    sink.sink_map_err(TransportError::from)
        .with(move |packet: Packet| {
            let mut codec = codec;
            let mut buffer = BytesMut::new();
            let frame = codec
                .encode(packet, &mut buffer)
                .map(|()| WsMessage::Binary(buffer.freeze()))
                .map_err(TransportError::from);
            future::ready(frame)
        })
}
