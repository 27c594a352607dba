//! Delivery of bus messages to WebSocket sessions.
//!
//! Every registered feed session gets a consumer on the feed command queue
//! that only sees messages whose `feedId` header names that feed; every UI
//! session gets one on the UI command queue filtered on `uiClientId`. The
//! consumer lives exactly as long as the registry entry.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

use super::outbound;
use super::session::WsSession;
use super::sessions::{SessionRegistry, WsEndpoints, WsSessionListener};
use super::{HEADER_FEED_ID, HEADER_UI_CLIENT_ID, feed_command_queue, ui_command_queue};
use crate::broker::{Endpoint, MessageSelector};
use crate::context::{ConnectionContextFactory, ConsumerContext};
use crate::message::AnyMessage;
use crate::processor::{Delivery, MessageListener, MessageProcessor};
use crate::utils::error::BusError;

/// Wires the bus into both registries of a set of endpoints.
pub struct BusEndpointProcessors;

impl BusEndpointProcessors {
    pub fn attach(
        endpoints: &WsEndpoints,
        contexts: Arc<ConnectionContextFactory>,
        processor: MessageProcessor,
    ) {
        Self::attach_registry(
            endpoints.feeds(),
            feed_command_queue(),
            HEADER_FEED_ID,
            contexts.clone(),
            processor.clone(),
        );
        Self::attach_registry(
            endpoints.ui_clients(),
            ui_command_queue(),
            HEADER_UI_CLIENT_ID,
            contexts,
            processor,
        );
    }

    fn attach_registry(
        registry: &SessionRegistry,
        queue: Endpoint,
        header: &'static str,
        contexts: Arc<ConnectionContextFactory>,
        processor: MessageProcessor,
    ) {
        registry.add_listener_producer(Arc::new(move |key: &str, session: &WsSession| {
            let listener: Box<dyn WsSessionListener> = Box::new(BusSessionListener {
                queue: queue.clone(),
                header,
                key: key.to_string(),
                session: session.clone(),
                contexts: contexts.clone(),
                processor: processor.clone(),
                consumer: Mutex::new(None),
            });
            Some(listener)
        }));
    }
}

struct BusSessionListener {
    queue: Endpoint,
    header: &'static str,
    key: String,
    session: WsSession,
    contexts: Arc<ConnectionContextFactory>,
    processor: MessageProcessor,
    consumer: Mutex<Option<ConsumerContext>>,
}

impl BusSessionListener {
    fn start(&self) -> Result<ConsumerContext, BusError> {
        let selector = MessageSelector::equals(self.header, &self.key)?;
        let consumer = self
            .contexts
            .create_consumer_context(&self.queue, Some(selector.as_str()))?;
        self.processor.listen(
            &consumer,
            SessionForwarder {
                header: self.header,
                key: self.key.clone(),
                session: self.session.clone(),
            },
        )?;
        Ok(consumer)
    }
}

impl WsSessionListener for BusSessionListener {
    fn session_added(&self) {
        match self.start() {
            Ok(consumer) => {
                debug!(
                    key = %self.key,
                    destination = %consumer.destination(),
                    "bus consumer attached"
                );
                *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);
            }
            Err(e) => error!(
                key = %self.key,
                queue = %self.queue,
                error = %e,
                "cannot attach bus consumer to WebSocket session"
            ),
        }
    }

    fn session_removed(&self) {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            consumer.close();
            debug!(key = %self.key, "bus consumer detached");
        }
    }
}

/// Pushes every message addressed to one key onto its session.
struct SessionForwarder {
    header: &'static str,
    key: String,
    session: WsSession,
}

impl MessageListener for SessionForwarder {
    type Message = Box<dyn AnyMessage>;

    fn on_message(&self, delivery: Delivery<Box<dyn AnyMessage>>) {
        if delivery.meta().headers.get(self.header) != Some(&self.key) {
            warn!(
                key = %self.key,
                header = self.header,
                "ignoring message addressed to another session"
            );
            return;
        }
        let Delivery {
            message,
            attachment,
        } = delivery;
        if let Err(e) = outbound::send_sync_blocking(&self.session, message.body.as_ref(), attachment) {
            warn!(
                key = %self.key,
                session = %self.session.id(),
                request = message.body.type_name(),
                error = %e,
                "cannot forward message to WebSocket session"
            );
        }
    }
}
