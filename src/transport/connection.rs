//! Protocol driver for one client connection.
//!
//! Both listeners decode their transport into a stream of [`Packet`]s and a
//! sink accepting them, then hand both to [`drive_connection`]. The driver
//! owns the MQTT session state machine: CONNECT first, then the packet loop
//! until DISCONNECT, a transport error or a keep-alive timeout.
//!
//! Writes never happen on the read path. Every packet for the client (our
//! acknowledgements as well as deliveries from the broker) goes through the
//! session's outgoing channel and is written by a dedicated writer task, so a
//! slow socket only ever stalls its own connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::session::SessionHandle;
use crate::broker::{Broker, Envelope, Origin, QoS, TopicFilter, TopicName};
use crate::client::{Client, Outgoing};
use crate::transport::codec::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, Publish, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use crate::utils::error::TransportError;

/// Why the packet loop ended.
#[derive(Debug)]
enum Exit {
    /// The client sent DISCONNECT.
    Graceful,
    /// Anything else. The will message is published.
    Ungraceful(String),
}

/// Run one connection to completion.
pub async fn drive_connection<S, K>(stream: S, mut sink: K, broker: Arc<Broker>, peer: String)
where
    S: Stream<Item = Result<Packet, TransportError>>,
    K: Sink<Packet, Error = TransportError> + Unpin + Send + 'static,
{
    let mut stream = std::pin::pin!(stream);
    let settings = broker.settings().clone();

    let connect = match timeout(settings.connect_timeout(), stream.next()).await {
        Ok(Some(Ok(Packet::Connect(connect)))) => connect,
        Ok(Some(Ok(other))) => {
            warn!("{peer}: expected CONNECT, got {other:?}");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!("{peer}: failed to read CONNECT: {e}");
            return;
        }
        Ok(None) => {
            debug!("{peer}: closed before CONNECT");
            return;
        }
        Err(_) => {
            warn!("{peer}: no CONNECT within {:?}", settings.connect_timeout());
            return;
        }
    };

    if let Some(code) = refusal(&connect) {
        warn!(
            "{peer}: refusing {} ({}/{}): {code:?}",
            connect.client_id, connect.protocol_name, connect.protocol_level
        );
        let _ = sink.send(connack(code)).await;
        return;
    }

    let client_id = if connect.client_id.is_empty() {
        format!("auto-{}", uuid::Uuid::new_v4())
    } else {
        connect.client_id.clone()
    };

    let (tx, rx) = mpsc::unbounded_channel::<Outgoing>();
    let client = Client::new(client_id.clone(), tx);
    let Some(handle) = broker.connect(client.clone()) else {
        let _ = sink.send(connack(ConnectReturnCode::ServerUnavailable)).await;
        return;
    };
    client.send(connack(ConnectReturnCode::Accepted));
    info!("{client_id} connected from {peer}");

    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        settings.write_timeout(),
        client_id.clone(),
    ));

    // Clients get one and a half keep-alive periods before being dropped.
    let idle = (connect.keep_alive > 0)
        .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

    let mut connection = Connection {
        broker: &broker,
        client: &client,
        handle: &handle,
    };
    let exit = loop {
        tokio::select! {
            _ = &mut writer => break Exit::Ungraceful("transport closed".to_string()),
            next = next_packet(&mut stream, idle) => match next {
                Ok(Some(packet)) => {
                    if let Some(exit) = connection.handle_packet(packet) {
                        break exit;
                    }
                }
                Ok(None) => break Exit::Ungraceful("connection closed by client".to_string()),
                Err(e) => break Exit::Ungraceful(e.to_string()),
            },
        }
    };

    match &exit {
        Exit::Graceful => info!("{client_id} disconnected"),
        Exit::Ungraceful(reason) => {
            info!("{client_id} dropped: {reason}");
            if let Some(will) = connect.will {
                publish_will(&broker, &client_id, will);
            }
        }
    }

    broker.disconnect(&handle);
    client.close();
}

fn refusal(connect: &Connect) -> Option<ConnectReturnCode> {
    if !connect.is_supported_protocol() {
        return Some(ConnectReturnCode::UnacceptableProtocolVersion);
    }
    // An empty id is only allowed when nothing has to be remembered for it.
    if connect.client_id.is_empty() && !connect.clean_session {
        return Some(ConnectReturnCode::IdentifierRejected);
    }
    None
}

fn connack(code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck {
        session_present: false,
        code,
    })
}

async fn next_packet<S>(
    stream: &mut S,
    idle: Option<Duration>,
) -> Result<Option<Packet>, TransportError>
where
    S: Stream<Item = Result<Packet, TransportError>> + Unpin,
{
    let next = match idle {
        Some(idle) => timeout(idle, stream.next())
            .await
            .map_err(|_| TransportError::Timeout("keep-alive expired"))?,
        None => stream.next().await,
    };
    next.transpose()
}

async fn write_loop<K>(
    mut sink: K,
    mut rx: UnboundedReceiver<Outgoing>,
    write_timeout: Duration,
    client_id: String,
) where
    K: Sink<Packet, Error = TransportError> + Unpin,
{
    while let Some(outgoing) = rx.recv().await {
        let packet = match outgoing {
            Outgoing::Packet(packet) => packet,
            Outgoing::Close => break,
        };
        match timeout(write_timeout, sink.send(packet)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Failed to send to {client_id}: {e}");
                break;
            }
            Err(_) => {
                warn!("Write to {client_id} timed out after {write_timeout:?}");
                break;
            }
        }
    }
    let _ = timeout(write_timeout, sink.close()).await;
    debug!("Send loop closed for {client_id}");
}

fn publish_will(broker: &Broker, client_id: &str, will: LastWill) {
    match TopicName::new(will.topic) {
        Ok(topic) => {
            let envelope = Envelope::new(topic, will.message)
                .with_qos(will.qos)
                .with_retain(will.retain);
            broker.publish(envelope, Origin::Client(client_id.to_string()));
        }
        Err(e) => warn!("Discarding will of {client_id}: {e}"),
    }
}

/// Packet handling for an accepted session.
struct Connection<'a> {
    broker: &'a Broker,
    client: &'a Client,
    handle: &'a SessionHandle,
}

impl Connection<'_> {
    /// Returns `Some` when the connection must end.
    fn handle_packet(&mut self, packet: Packet) -> Option<Exit> {
        self.broker.touch(self.handle);
        match packet {
            Packet::Publish(publish) => self.on_publish(publish),
            Packet::PubAck(packet_id) => {
                self.broker.acknowledge(self.handle, packet_id);
                None
            }
            Packet::Subscribe(subscribe) => {
                self.on_subscribe(subscribe);
                None
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.on_unsubscribe(unsubscribe);
                None
            }
            Packet::PingReq => {
                self.client.send(Packet::PingResp);
                None
            }
            Packet::Disconnect => Some(Exit::Graceful),
            Packet::Connect(_) => Some(Exit::Ungraceful("second CONNECT".to_string())),
            other => Some(Exit::Ungraceful(format!(
                "unexpected packet from client: {other:?}"
            ))),
        }
    }

    fn on_publish(&mut self, publish: Publish) -> Option<Exit> {
        let topic = match TopicName::new(publish.topic) {
            Ok(topic) => topic,
            Err(e) => return Some(Exit::Ungraceful(format!("invalid publish topic: {e}"))),
        };
        let envelope = Envelope::new(topic, publish.payload)
            .with_qos(publish.qos)
            .with_retain(publish.retain);

        let report = self
            .broker
            .publish(envelope, Origin::Client(self.handle.id.clone()));
        debug!(
            "{} published: {} delivered, {} handlers",
            self.handle.id, report.delivered, report.handlers_invoked
        );

        if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
            self.client.send(Packet::PubAck(packet_id));
        }
        None
    }

    fn on_subscribe(&mut self, subscribe: Subscribe) {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut replay = Vec::new();

        for requested in subscribe.filters {
            let (Ok(filter), Some(granted)) = (
                TopicFilter::new(requested.filter.as_str()),
                QoS::granted(requested.requested_qos),
            ) else {
                warn!("{} sent invalid filter '{}'", self.handle.id, requested.filter);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            };

            match self.broker.subscribe(self.handle, filter, granted) {
                Ok(retained) => {
                    info!("{} subscribed to {}", self.handle.id, requested.filter);
                    return_codes.push(SubscribeReturnCode::Success(granted));
                    replay.push((retained, granted));
                }
                Err(e) => {
                    debug!("Subscribe rejected: {e}");
                    return_codes.push(SubscribeReturnCode::Failure);
                }
            }
        }

        self.client.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }));
        for (retained, granted) in replay {
            if !retained.is_empty() {
                self.broker.deliver_retained(self.handle, retained, granted);
            }
        }
    }

    fn on_unsubscribe(&mut self, unsubscribe: Unsubscribe) {
        for filter in &unsubscribe.filters {
            match TopicFilter::new(filter.as_str()) {
                Ok(filter) => {
                    if let Ok(true) = self.broker.unsubscribe(self.handle, &filter) {
                        info!("{} unsubscribed from {filter}", self.handle.id);
                    }
                }
                Err(e) => debug!("Ignoring unsubscribe from '{filter}': {e}"),
            }
        }
        self.client.send(Packet::UnsubAck(unsubscribe.packet_id));
    }
}
