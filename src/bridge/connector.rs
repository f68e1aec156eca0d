use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::bridge::backoff::Backoff;
use crate::broker::{Broker, Envelope, Origin, QoS, TopicName};
use crate::config::BridgeSettings;
use crate::utils::error::BridgeError;

/// Capacity of the request queue between an upstream client and its event loop.
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BridgeState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    OfflineRetrying,
}

/// Handle on the current upstream connection, shared with the forwarder.
///
/// Empty while the bridge is not connected. Each connection attempt installs
/// its own client, so nothing queued for an old connection survives it.
#[derive(Default)]
pub struct UpstreamLink {
    client: Mutex<Option<AsyncClient>>,
    forwarded: AtomicUsize,
}

impl UpstreamLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> MutexGuard<'_, Option<AsyncClient>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_online(&self) -> bool {
        self.client().is_some()
    }

    /// Publishes handed to an upstream connection so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub(crate) fn attach(&self, client: AsyncClient) {
        *self.client() = Some(client);
    }

    pub(crate) fn detach(&self) {
        self.client().take();
    }

    /// Queue a QoS 1 publish on the upstream connection without waiting.
    pub fn publish(&self, topic: &str, payload: String) -> Result<(), BridgeError> {
        let guard = self.client();
        let client = guard.as_ref().ok_or(BridgeError::Offline)?;
        client.try_publish(topic, rumqttc::QoS::AtLeastOnce, false, payload)?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink")
            .field("online", &self.is_online())
            .field("forwarded", &self.forwarded())
            .finish()
    }
}

/// Keeps the client connection to the upstream broker alive.
///
/// Upstream messages matching the subscribe filter are re-published into the
/// local broker with [`Origin::Bridge`]: local subscribers and the aggregator
/// see them, the forwarder does not send them back.
pub struct BridgeConnector {
    settings: BridgeSettings,
    broker: Arc<Broker>,
    link: Arc<UpstreamLink>,
    state: watch::Sender<BridgeState>,
}

impl BridgeConnector {
    pub fn new(settings: BridgeSettings, broker: Arc<Broker>, link: Arc<UpstreamLink>) -> Self {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        Self {
            settings,
            broker,
            link,
            state,
        }
    }

    pub fn link(&self) -> Arc<UpstreamLink> {
        self.link.clone()
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Bridge state: {previous:?} -> {state:?}");
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.settings.host, self.settings.port)
    }

    /// Connect, and reconnect with backoff, until the task is dropped.
    pub async fn run(self) {
        let mut backoff = Backoff::from_settings(&self.settings);
        loop {
            self.set_state(BridgeState::Connecting);
            let err = self.run_connection(&mut backoff).await;
            self.link.detach();
            self.set_state(BridgeState::OfflineRetrying);

            let delay = backoff.next_delay();
            warn!(
                "Bridge to {} offline: {err}. Reconnecting in {delay:?} (attempt {})",
                self.endpoint(),
                backoff.attempt()
            );
            sleep(delay).await;
        }
    }

    /// One connection generation. Returns the error that ended it.
    async fn run_connection(&self, backoff: &mut Backoff) -> BridgeError {
        let client_id = format!(
            "{}-{}",
            self.settings.client_id_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let mut options = MqttOptions::new(
            client_id.as_str(),
            self.settings.host.as_str(),
            self.settings.port,
        );
        options
            .set_keep_alive(self.settings.keep_alive())
            .set_clean_session(true);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        debug!("Connecting to {} as {client_id}", self.endpoint());
        match timeout(
            self.settings.connect_timeout(),
            wait_for_connack(&mut eventloop),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e,
            Err(_) => return BridgeError::ConnectTimeout(self.settings.connect_timeout()),
        }

        if let Err(e) = self.on_connected(&client, &client_id).await {
            return e;
        }
        backoff.reset();
        self.link.attach(client);
        self.set_state(BridgeState::Connected);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => self.republish(publish),
                Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, rumqttc::SubscribeReasonCode::Failure));
                    if refused {
                        warn!(
                            "Upstream refused subscription to {}",
                            self.settings.subscribe_filter
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => return e.into(),
            }
        }
    }

    async fn on_connected(&self, client: &AsyncClient, client_id: &str) -> Result<(), BridgeError> {
        info!("Bridge connected to {} as {client_id}", self.endpoint());

        client
            .subscribe(
                self.settings.subscribe_filter.as_str(),
                rumqttc::QoS::AtLeastOnce,
            )
            .await?;

        if let Some(topic) = self.settings.heartbeat_topic() {
            let heartbeat = json!({
                "client_id": client_id,
                "status": "online",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            client.try_publish(
                topic,
                rumqttc::QoS::AtMostOnce,
                false,
                heartbeat.to_string(),
            )?;
        }
        Ok(())
    }

    fn republish(&self, publish: rumqttc::Publish) {
        let topic = match TopicName::new(publish.topic.as_str()) {
            Ok(topic) => topic,
            Err(e) => {
                warn!("Ignoring upstream publish: {e}");
                return;
            }
        };
        let qos = match publish.qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce | rumqttc::QoS::ExactlyOnce => QoS::AtLeastOnce,
        };

        let envelope = Envelope::new(topic, publish.payload)
            .with_qos(qos)
            .with_retain(publish.retain);
        let report = self.broker.publish(envelope, Origin::Bridge);
        debug!(
            "Upstream '{}': {} delivered, {} handlers",
            publish.topic, report.delivered, report.handlers_invoked
        );
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BridgeError> {
    loop {
        if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}
