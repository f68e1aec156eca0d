//! Session registry
//!
//! Tracks every connected client, its subscriptions and the QoS 1 publishes
//! still waiting for a PUBACK. The registry is plain data: the broker engine
//! keeps it behind a single lock so all mutations are serialized.
//!
//! Sessions are clean-session only. When a session ends, its subscriptions and
//! its unacknowledged publishes go with it.
//!
//! Client ids are unique among connected clients. Registering an id that is
//! already connected evicts the previous holder. Each registration gets a new
//! generation number, and every operation takes a [`SessionHandle`] carrying
//! that generation, so a connection that was evicted can never touch the
//! session that replaced it.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::broker::message::{Envelope, QoS};
use crate::broker::topic::{MULTI_LEVEL, SINGLE_LEVEL, TopicFilter, TopicName};
use crate::client::Client;
use crate::transport::codec::{Packet, Publish};
use crate::utils::error::RegistryError;

pub type SessionId = String;

/// Identifies one registration of a client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: SessionId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: TopicFilter,
    pub qos: QoS,
}

/// A QoS 1 publish sent to a session and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct InflightPublish {
    pub packet: Publish,
    pub sent_at: Instant,
    pub retries: u8,
}

#[derive(Debug)]
pub struct Session {
    pub client: Client,
    generation: u64,
    subscriptions: Vec<Subscription>,
    inflight: HashMap<u16, InflightPublish>,
    next_packet_id: u16,
    last_seen: Instant,
}

impl Session {
    fn new(client: Client, generation: u64) -> Self {
        Self {
            client,
            generation,
            subscriptions: Vec::new(),
            inflight: HashMap::new(),
            next_packet_id: 0,
            last_seen: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.client.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.client.id.clone(),
            generation: self.generation,
        }
    }

    /// Subscriptions in the order they were first made.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Highest QoS among this session's filters matching `topic`.
    fn best_match(&self, topic: &TopicName) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|subscription| subscription.filter.matches(topic))
            .map(|subscription| subscription.qos)
            .max()
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        if self.inflight.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id != 0 && !self.inflight.contains_key(&self.next_packet_id) {
                return Some(self.next_packet_id);
            }
        }
    }

    /// Queue a copy of `envelope` for this session at `qos`.
    ///
    /// Returns `false` when the session's transport has already gone away.
    pub fn deliver(&mut self, envelope: &Envelope, qos: QoS, retain: bool) -> bool {
        let mut packet = Publish::new(envelope.topic.as_str(), envelope.payload.clone())
            .with_retain(retain);

        if qos == QoS::AtLeastOnce {
            let Some(packet_id) = self.allocate_packet_id() else {
                return false;
            };
            packet = packet.with_qos(QoS::AtLeastOnce, Some(packet_id));
            self.inflight.insert(
                packet_id,
                InflightPublish {
                    packet: packet.clone(),
                    sent_at: Instant::now(),
                    retries: 0,
                },
            );
            if !self.client.send(Packet::Publish(packet)) {
                self.inflight.remove(&packet_id);
                return false;
            }
            return true;
        }

        self.client.send(Packet::Publish(packet))
    }

    pub fn acknowledge(&mut self, packet_id: u16) -> bool {
        self.inflight.remove(&packet_id).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Literal(String),
    Wildcard,
}

impl IndexKey {
    fn for_filter(filter: &TopicFilter) -> Self {
        match filter.first_segment() {
            SINGLE_LEVEL | MULTI_LEVEL => IndexKey::Wildcard,
            literal => IndexKey::Literal(literal.to_string()),
        }
    }
}

/// Result of one pass over the unacknowledged QoS 1 publishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub resent: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    /// First filter segment -> sessions with at least one filter starting there.
    index: HashMap<IndexKey, HashSet<SessionId>>,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Install a session for `client`, evicting any session holding the same id.
    ///
    /// The evicted session's transport is asked to close and the session is
    /// returned to the caller with its subscriptions already removed.
    pub fn register(&mut self, client: Client) -> (SessionHandle, Option<Session>) {
        let evicted = self.remove(&client.id);
        if let Some(previous) = &evicted {
            previous.client.close();
        }

        self.next_generation += 1;
        let session = Session::new(client, self.next_generation);
        let handle = session.handle();
        self.sessions.insert(handle.id.clone(), session);
        (handle, evicted)
    }

    pub fn get(&self, handle: &SessionHandle) -> Option<&Session> {
        self.sessions
            .get(&handle.id)
            .filter(|session| session.generation == handle.generation)
    }

    fn get_mut(&mut self, handle: &SessionHandle) -> Result<&mut Session, RegistryError> {
        self.sessions
            .get_mut(&handle.id)
            .filter(|session| session.generation == handle.generation)
            .ok_or_else(|| RegistryError::UnknownSession(handle.id.clone()))
    }

    /// Add or update a subscription. Returns `true` when the filter is new for
    /// the session, `false` when an existing subscription had its QoS replaced.
    pub fn subscribe(
        &mut self,
        handle: &SessionHandle,
        filter: TopicFilter,
        qos: QoS,
    ) -> Result<bool, RegistryError> {
        let session = self.get_mut(handle)?;
        if let Some(existing) = session
            .subscriptions
            .iter_mut()
            .find(|subscription| subscription.filter == filter)
        {
            existing.qos = qos;
            return Ok(false);
        }

        let key = IndexKey::for_filter(&filter);
        session.subscriptions.push(Subscription { filter, qos });
        self.index.entry(key).or_default().insert(handle.id.clone());
        Ok(true)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(
        &mut self,
        handle: &SessionHandle,
        filter: &TopicFilter,
    ) -> Result<bool, RegistryError> {
        let session = self.get_mut(handle)?;
        let before = session.subscriptions.len();
        session
            .subscriptions
            .retain(|subscription| &subscription.filter != filter);
        if session.subscriptions.len() == before {
            return Ok(false);
        }

        let key = IndexKey::for_filter(filter);
        let still_indexed = session
            .subscriptions
            .iter()
            .any(|subscription| IndexKey::for_filter(&subscription.filter) == key);
        if !still_indexed {
            self.unindex(&key, &handle.id);
        }
        Ok(true)
    }

    /// Remove the session and all of its subscriptions.
    ///
    /// A handle from an older generation is ignored, so a connection that was
    /// evicted cannot tear down its replacement.
    pub fn terminate(&mut self, handle: &SessionHandle) -> Option<Session> {
        if self.get(handle).is_none() {
            return None;
        }
        self.remove(&handle.id)
    }

    fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        for subscription in &session.subscriptions {
            self.unindex(&IndexKey::for_filter(&subscription.filter), id);
        }
        Some(session)
    }

    fn unindex(&mut self, key: &IndexKey, id: &str) {
        if let Some(ids) = self.index.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                self.index.remove(key);
            }
        }
    }

    pub fn touch(&mut self, handle: &SessionHandle) {
        if let Ok(session) = self.get_mut(handle) {
            session.last_seen = Instant::now();
        }
    }

    /// Every session with a filter matching `topic`, once each, at the highest
    /// QoS any of its matching filters was granted.
    ///
    /// Candidates are pruned by the first filter segment; the result is the
    /// same as testing every live subscription.
    pub fn subscribers_for(&self, topic: &TopicName) -> Vec<(SessionId, QoS)> {
        let literal = IndexKey::Literal(topic.first_segment().to_string());
        let wildcard = IndexKey::Wildcard;
        let candidates = [&literal, &wildcard]
            .into_iter()
            .filter_map(|key| self.index.get(key))
            .flatten();

        let mut seen = HashSet::new();
        let mut subscribers = Vec::new();
        for id in candidates {
            if !seen.insert(id) {
                continue;
            }
            if let Some(qos) = self
                .sessions
                .get(id)
                .and_then(|session| session.best_match(topic))
            {
                subscribers.push((id.clone(), qos));
            }
        }
        subscribers
    }

    /// Queue `envelope` for the session currently holding `id`.
    ///
    /// A session that disappeared since it was resolved is reported as
    /// unknown; callers treat that as a silent drop.
    pub fn deliver(
        &mut self,
        id: &str,
        envelope: &Envelope,
        qos: QoS,
        retain: bool,
    ) -> Result<bool, RegistryError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSession(id.to_string()))?;
        Ok(session.deliver(envelope, qos, retain))
    }

    pub fn acknowledge(&mut self, handle: &SessionHandle, packet_id: u16) -> bool {
        self.get_mut(handle)
            .map(|session| session.acknowledge(packet_id))
            .unwrap_or(false)
    }

    /// Resend QoS 1 publishes that were not acknowledged within `ack_timeout`
    /// with the DUP flag set, and drop those that already used `max_retries`.
    pub fn redeliver_expired(&mut self, ack_timeout: Duration, max_retries: u8) -> RetryOutcome {
        let now = Instant::now();
        let mut outcome = RetryOutcome::default();

        for session in self.sessions.values_mut() {
            let mut exhausted = Vec::new();
            for (packet_id, pending) in session.inflight.iter_mut() {
                if now.duration_since(pending.sent_at) < ack_timeout {
                    continue;
                }
                if pending.retries >= max_retries {
                    exhausted.push(*packet_id);
                    continue;
                }

                pending.retries += 1;
                pending.sent_at = now;
                let mut packet = pending.packet.clone();
                packet.dup = true;
                if session.client.send(Packet::Publish(packet)) {
                    outcome.resent += 1;
                } else {
                    exhausted.push(*packet_id);
                }
            }

            for packet_id in exhausted {
                session.inflight.remove(&packet_id);
                outcome.dropped += 1;
                tracing::warn!(
                    "Dropped publish {packet_id} to {} after {max_retries} retries",
                    session.client.id
                );
            }
        }

        outcome
    }
}
