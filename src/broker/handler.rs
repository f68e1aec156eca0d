//! Server-side topic handlers
//!
//! A handler declares the filter it is interested in and is called by the
//! broker for every matching publish that entered from a client or from the
//! bridge, before the publish is fanned out to subscribers. Handlers are
//! registered at startup; the broker works the same with none registered.

use crate::broker::engine::{Broker, PublishReport};
use crate::broker::message::{Envelope, Origin};
use crate::broker::topic::TopicFilter;
use crate::utils::error::HandlerError;

pub trait TopicHandler: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Filter selecting the publishes this handler sees.
    fn interest(&self) -> &TopicFilter;

    /// React to one publish. An error (or a panic) is logged by the broker and
    /// does not stop delivery to subscribers or to other handlers.
    fn handle(
        &self,
        envelope: &Envelope,
        origin: &Origin,
        publisher: &Publisher<'_>,
    ) -> Result<(), HandlerError>;
}

/// Publish capability handed to handlers, scoped to the broker that invoked them.
///
/// Publishes made through it carry [`Origin::Internal`] and therefore reach
/// subscribers but never re-enter the handlers.
pub struct Publisher<'a> {
    broker: &'a Broker,
}

impl<'a> Publisher<'a> {
    pub(crate) fn new(broker: &'a Broker) -> Self {
        Self { broker }
    }

    pub fn publish(&self, envelope: Envelope) -> PublishReport {
        self.broker.publish(envelope, Origin::Internal)
    }
}
