//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - registering sessions and their subscriptions
//! - running the registered topic handlers for each publish
//! - fanning publishes out to every matching subscriber
//! - tracking QoS 1 deliveries and retrying them until acknowledged
//! - keeping retained messages and replaying them to new subscriptions
//!
//! Concurrency and usage notes:
//! - The broker is shared as `Arc<Broker>`. The session registry sits behind a
//!   single mutex, so every mutation is serialized. Delivery only enqueues onto
//!   each session's outgoing channel; the lock is never held across network
//!   I/O.
//! - Handlers run without any broker lock held, so they may publish back
//!   through the [`Publisher`] they are given.
//! - QoS 1 is at-least-once within one connection only. Unacknowledged
//!   publishes are retried by [`Broker::start_retry_loop`] with the DUP flag
//!   up to a retry cap, and are discarded when the session ends. Nothing is
//!   redelivered after a reconnect, since sessions do not outlive their
//!   connection.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, error, info, warn};

use crate::broker::handler::{Publisher, TopicHandler};
use crate::broker::message::{Envelope, Origin, QoS};
use crate::broker::session::{SessionHandle, SessionRegistry};
use crate::broker::topic::{TopicFilter, TopicName};
use crate::client::Client;
use crate::config::BrokerSettings;
use crate::utils::error::RegistryError;

/// What happened to one publish. Returned to the caller in place of a
/// completion callback.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub handlers_invoked: usize,
    pub handler_failures: usize,
    pub delivered: usize,
    pub dropped: usize,
}

impl PublishReport {
    /// No handler and no subscriber was interested. A normal outcome.
    pub fn is_unmatched(&self) -> bool {
        self.handlers_invoked == 0 && self.delivered == 0 && self.dropped == 0
    }
}

pub struct Broker {
    registry: Mutex<SessionRegistry>,
    handlers: RwLock<Vec<Arc<dyn TopicHandler>>>,
    retained: Mutex<BTreeMap<TopicName, Envelope>>,
    settings: BrokerSettings,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("sessions", &self.session_count())
            .field("handlers", &self.handler_count())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_settings(BrokerSettings::default())
    }

    pub fn with_settings(settings: BrokerSettings) -> Self {
        Self {
            registry: Mutex::new(SessionRegistry::new()),
            handlers: RwLock::new(Vec::new()),
            retained: Mutex::new(BTreeMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retained(&self) -> MutexGuard<'_, BTreeMap<TopicName, Envelope>> {
        self.retained.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_handler(&self, handler: Arc<dyn TopicHandler>) {
        info!(
            "Registered handler '{}' on '{}'",
            handler.name(),
            handler.interest()
        );
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn session_count(&self) -> usize {
        self.registry().len()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.registry().contains(client_id)
    }

    /// Subscriptions of a connected session, in subscription order.
    pub fn subscriptions_of(&self, handle: &SessionHandle) -> Vec<(TopicFilter, QoS)> {
        self.registry()
            .get(handle)
            .map(|session| {
                session
                    .subscriptions()
                    .iter()
                    .map(|subscription| (subscription.filter.clone(), subscription.qos))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Register a freshly connected client.
    ///
    /// Returns `None` when the broker is full. A client reusing a connected id
    /// is always accepted and evicts the older connection.
    pub fn connect(&self, client: Client) -> Option<SessionHandle> {
        let mut registry = self.registry();
        if registry.len() >= self.settings.max_connections && !registry.contains(&client.id) {
            warn!(
                "Refusing {}: {} sessions already connected",
                client.id,
                registry.len()
            );
            return None;
        }

        let (handle, evicted) = registry.register(client);
        if let Some(previous) = evicted {
            info!(
                "Evicted previous session of {} ({} subscriptions dropped)",
                previous.id(),
                previous.subscriptions().len()
            );
        }
        Some(handle)
    }

    /// Remove a session and all of its subscriptions. Returns whether the
    /// handle still referred to a live session.
    pub fn disconnect(&self, handle: &SessionHandle) -> bool {
        match self.registry().terminate(handle) {
            Some(session) => {
                debug!(
                    "Cleaned up {} ({} subscriptions, {} unacknowledged publishes)",
                    session.id(),
                    session.subscriptions().len(),
                    session.inflight_len()
                );
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, handle: &SessionHandle) {
        self.registry().touch(handle);
    }

    /// Subscribe (or update the QoS of) `filter` and return the retained
    /// messages it matches. The caller replays them with
    /// [`Broker::deliver_retained`] once the SUBACK is queued.
    pub fn subscribe(
        &self,
        handle: &SessionHandle,
        filter: TopicFilter,
        qos: QoS,
    ) -> Result<Vec<Envelope>, RegistryError> {
        let retained = self.retained_matching(&filter);
        self.registry().subscribe(handle, filter, qos)?;
        Ok(retained)
    }

    pub fn unsubscribe(
        &self,
        handle: &SessionHandle,
        filter: &TopicFilter,
    ) -> Result<bool, RegistryError> {
        self.registry().unsubscribe(handle, filter)
    }

    pub fn acknowledge(&self, handle: &SessionHandle, packet_id: u16) {
        if !self.registry().acknowledge(handle, packet_id) {
            debug!("PUBACK for unknown packet id {packet_id} from {}", handle.id);
        }
    }

    fn retained_matching(&self, filter: &TopicFilter) -> Vec<Envelope> {
        self.retained()
            .values()
            .filter(|envelope| filter.matches(&envelope.topic))
            .cloned()
            .collect()
    }

    pub fn retained_count(&self) -> usize {
        self.retained().len()
    }

    /// Queue retained messages for one session with the retain flag set.
    pub fn deliver_retained(
        &self,
        handle: &SessionHandle,
        messages: Vec<Envelope>,
        granted: QoS,
    ) -> usize {
        let mut registry = self.registry();
        if registry.get(handle).is_none() {
            return 0;
        }
        messages
            .iter()
            .filter(|envelope| {
                matches!(
                    registry.deliver(&handle.id, envelope, envelope.qos.min(granted), true),
                    Ok(true)
                )
            })
            .count()
    }

    fn store_retained(&self, envelope: &Envelope) {
        let mut retained = self.retained();
        if envelope.payload.is_empty() {
            retained.remove(&envelope.topic);
        } else {
            retained.insert(envelope.topic.clone(), envelope.clone());
        }
    }

    /// Route one publish.
    ///
    /// Interested handlers run first, each isolated from the others' failures,
    /// then a copy goes to every matching session at the lower of the publish
    /// QoS and the subscription QoS. Delivery to a session that vanished in the
    /// meantime is dropped silently.
    pub fn publish(&self, envelope: Envelope, origin: Origin) -> PublishReport {
        let mut report = PublishReport::default();

        if envelope.retain {
            self.store_retained(&envelope);
        }

        if origin.dispatches_handlers() {
            self.dispatch_handlers(&envelope, &origin, &mut report);
        }

        let mut registry = self.registry();
        let subscribers = registry.subscribers_for(&envelope.topic);
        for (id, granted) in subscribers {
            let qos = envelope.qos.min(granted);
            match registry.deliver(&id, &envelope, qos, false) {
                Ok(true) => report.delivered += 1,
                Ok(false) | Err(_) => {
                    report.dropped += 1;
                    debug!("Dropped publish on '{}' for {id}", envelope.topic);
                }
            }
        }
        drop(registry);

        if report.is_unmatched() {
            debug!("No subscribers for '{}' from {origin}", envelope.topic);
        }
        report
    }

    fn dispatch_handlers(&self, envelope: &Envelope, origin: &Origin, report: &mut PublishReport) {
        let interested: Vec<Arc<dyn TopicHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|handler| handler.interest().matches(&envelope.topic))
            .cloned()
            .collect();

        let publisher = Publisher::new(self);
        for handler in interested {
            report.handlers_invoked += 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                handler.handle(envelope, origin, &publisher)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.handler_failures += 1;
                    error!(
                        "Handler '{}' failed on '{}': {e}",
                        handler.name(),
                        envelope.topic
                    );
                }
                Err(_) => {
                    report.handler_failures += 1;
                    error!(
                        "Handler '{}' panicked on '{}'",
                        handler.name(),
                        envelope.topic
                    );
                }
            }
        }
    }

    /// Periodically resend unacknowledged QoS 1 publishes.
    pub async fn start_retry_loop(broker: Arc<Broker>) {
        let mut ticker = tokio::time::interval(broker.settings.retry_interval());
        loop {
            ticker.tick().await;
            let outcome = broker
                .registry()
                .redeliver_expired(broker.settings.ack_timeout(), broker.settings.max_retries);
            if outcome.resent > 0 || outcome.dropped > 0 {
                debug!(
                    "Retry pass: {} resent, {} dropped",
                    outcome.resent, outcome.dropped
                );
            }
        }
    }
}
