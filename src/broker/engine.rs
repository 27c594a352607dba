use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, trace};
use uuid::Uuid;

use super::memory::InMemoryConnectionFactory;
use super::topic::{Queue, Subscriber, SubscriberId, Topic};
use super::{Destination, DestinationKind, Endpoint, MessageSelector, TransportMessage};
use crate::message::MessageId;
use crate::utils::error::TransportError;

/// An in-process broker with queues, topics, and temporary destinations.
///
/// All routing state sits behind one mutex. Publishing only pushes onto
/// unbounded channels, so the lock is never held while a listener runs.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    topics: HashMap<String, Topic>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_factory(self: &Arc<Self>) -> InMemoryConnectionFactory {
        InMemoryConnectionFactory::new(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves an endpoint, creating the destination if needed.
    pub(crate) fn declare(&self, endpoint: &Endpoint) -> Destination {
        let kind = endpoint.kind();
        let temporary = endpoint.is_temporary();
        let name = if temporary {
            format!("TEMP-{}", Uuid::new_v4())
        } else {
            // Only the last path segment names the destination.
            endpoint
                .name()
                .rsplit('/')
                .next()
                .unwrap_or(endpoint.name())
                .to_string()
        };

        let mut state = self.state();
        match kind {
            DestinationKind::Queue => {
                state
                    .queues
                    .entry(name.clone())
                    .or_insert_with(|| Queue::new(&name, temporary));
            }
            DestinationKind::Topic => {
                state
                    .topics
                    .entry(name.clone())
                    .or_insert_with(|| Topic::new(&name, temporary));
            }
        }
        debug!(destination = %name, temporary, "declared destination");
        Destination::new(kind, name, temporary)
    }

    /// Stamps the message with an id and timestamp and routes it.
    pub(crate) fn publish(
        &self,
        destination: &Destination,
        mut message: TransportMessage,
    ) -> Result<MessageId, TransportError> {
        let id = MessageId::random();
        message.message_id = Some(id.clone());
        message.timestamp = Some(Utc::now().timestamp_millis());

        let mut state = self.state();
        match destination.kind() {
            DestinationKind::Queue => {
                if !state.queues.contains_key(destination.name()) {
                    if destination.is_temporary() {
                        return Err(TransportError::NoSuchDestination(destination.to_string()));
                    }
                    state.queues.insert(
                        destination.name().to_string(),
                        Queue::new(destination.name(), false),
                    );
                }
                if let Some(queue) = state.queues.get_mut(destination.name()) {
                    queue.publish(message);
                }
            }
            DestinationKind::Topic => match state.topics.get(destination.name()) {
                Some(topic) => {
                    if topic.publish(&message) == 0 {
                        debug!(%destination, "no subscriber took the message");
                    }
                }
                None if destination.is_temporary() => {
                    return Err(TransportError::NoSuchDestination(destination.to_string()));
                }
                None => debug!(%destination, "topic has no subscribers; message dropped"),
            },
        }
        trace!(%destination, message_id = %id, "published");
        Ok(id)
    }

    /// Routes a message a closing consumer never handed to its listener.
    /// Queue messages go to another consumer or back to pending; topic
    /// copies belong to the one subscriber and are dropped.
    pub(crate) fn redeliver(&self, destination: &Destination, message: TransportMessage) {
        if destination.kind() != DestinationKind::Queue {
            return;
        }
        match self.state().queues.get_mut(destination.name()) {
            Some(queue) => {
                trace!(%destination, message_id = ?message.message_id, "redelivering");
                queue.publish(message);
            }
            None => debug!(%destination, "queue is gone; undelivered message dropped"),
        }
    }

    pub(crate) fn subscribe(
        &self,
        destination: &Destination,
        selector: Option<MessageSelector>,
    ) -> Result<(SubscriberId, UnboundedReceiver<TransportMessage>), TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber = Subscriber { sender, selector };
        let id: SubscriberId = format!("consumer-{}", Uuid::new_v4());

        let mut state = self.state();
        let name = destination.name();
        match destination.kind() {
            DestinationKind::Queue => match state.queues.get_mut(name) {
                Some(queue) => queue.subscribe(id.clone(), subscriber),
                None if destination.is_temporary() => {
                    return Err(TransportError::NoSuchDestination(destination.to_string()));
                }
                None => {
                    let mut queue = Queue::new(name, false);
                    queue.subscribe(id.clone(), subscriber);
                    state.queues.insert(name.to_string(), queue);
                }
            },
            DestinationKind::Topic => match state.topics.get_mut(name) {
                Some(topic) => topic.subscribe(id.clone(), subscriber),
                None if destination.is_temporary() => {
                    return Err(TransportError::NoSuchDestination(destination.to_string()));
                }
                None => {
                    let mut topic = Topic::new(name, false);
                    topic.subscribe(id.clone(), subscriber);
                    state.topics.insert(name.to_string(), topic);
                }
            },
        }
        debug!(%destination, subscriber = %id, "subscribed");
        Ok((id, receiver))
    }

    /// Removes a subscriber. A temporary destination goes away with its
    /// last subscriber.
    pub(crate) fn unsubscribe(&self, destination: &Destination, id: &SubscriberId) {
        let mut state = self.state();
        let name = destination.name();
        match destination.kind() {
            DestinationKind::Queue => {
                let drop_queue = match state.queues.get_mut(name) {
                    Some(queue) => {
                        queue.unsubscribe(id);
                        queue.temporary && !queue.has_consumers()
                    }
                    None => false,
                };
                if drop_queue {
                    state.queues.remove(name);
                    debug!(%destination, "deleted temporary queue");
                }
            }
            DestinationKind::Topic => {
                let drop_topic = match state.topics.get_mut(name) {
                    Some(topic) => {
                        topic.unsubscribe(id);
                        topic.temporary && topic.subscribers.is_empty()
                    }
                    None => false,
                };
                if drop_topic {
                    state.topics.remove(name);
                    debug!(%destination, "deleted temporary topic");
                }
            }
        }
        debug!(%destination, subscriber = %id, "unsubscribed");
    }

    pub fn has_destination(&self, destination: &Destination) -> bool {
        let state = self.state();
        match destination.kind() {
            DestinationKind::Queue => state.queues.contains_key(destination.name()),
            DestinationKind::Topic => state.topics.contains_key(destination.name()),
        }
    }

    /// Number of consumers currently attached to a destination.
    pub fn consumer_count(&self, destination: &Destination) -> usize {
        let state = self.state();
        match destination.kind() {
            DestinationKind::Queue => state
                .queues
                .get(destination.name())
                .map_or(0, Queue::consumer_count),
            DestinationKind::Topic => state
                .topics
                .get(destination.name())
                .map_or(0, |topic| topic.subscribers.len()),
        }
    }

    /// Temporary queues and topics that still exist.
    pub fn temporary_count(&self) -> usize {
        let state = self.state();
        state.queues.values().filter(|queue| queue.temporary).count()
            + state.topics.values().filter(|topic| topic.temporary).count()
    }

    /// Number of messages waiting on a queue for a matching consumer.
    pub fn pending_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, Queue::pending_len)
    }
}
