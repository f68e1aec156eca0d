use std::sync::Arc;

use futures_util::{SinkExt, StreamExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::transport::codec::MqttCodec;
use crate::transport::connection::drive_connection;
use crate::utils::error::TransportError;

/// Accept native MQTT connections until the task is dropped.
pub async fn serve_tcp(listener: TcpListener, broker: Arc<Broker>) {
    if let Ok(addr) = listener.local_addr() {
        info!("MQTT server listening on tcp://{addr}");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_tcp(stream, peer.to_string(), broker.clone()));
            }
            Err(e) => warn!("Failed to accept TCP connection: {e}"),
        }
    }
}

async fn handle_tcp(stream: TcpStream, peer: String, broker: Arc<Broker>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{peer}: cannot disable Nagle: {e}");
    }

    let codec = MqttCodec::new(broker.settings().max_packet_size);
    let (sink, source) = Framed::new(stream, codec).split();
    drive_connection(
        source.map_err(TransportError::from),
        sink.sink_map_err(TransportError::from),
        broker,
        peer,
    )
    .await;
}
