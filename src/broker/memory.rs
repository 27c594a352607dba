//! [`InMemoryBroker`] behind the broker traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace};
use uuid::Uuid;

use super::topic::SubscriberId;
use super::{
    BrokerConnection, BrokerSession, ConnectionFactory, DeliveryListener, Destination, Endpoint,
    InMemoryBroker, MessageConsumer, MessageProducer, MessageSelector, TransportMessage,
};
use crate::message::MessageId;
use crate::utils::error::TransportError;

#[derive(Debug, Clone)]
pub struct InMemoryConnectionFactory {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryConnectionFactory {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    /// [`ConnectionFactory::create_connection`] without the trait object.
    pub fn connect(&self) -> Arc<InMemoryConnection> {
        let connection = InMemoryConnection {
            id: format!("connection-{}", Uuid::new_v4()),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            sessions: Arc::new(Registry::default()),
        };
        debug!(connection = %connection.id, "opened in-memory connection");
        Arc::new(connection)
    }
}

impl ConnectionFactory for InMemoryConnectionFactory {
    fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        Ok(self.connect())
    }
}

/// Open children of a connection or session, keyed by id. Children remove
/// themselves when they close.
#[derive(Debug)]
struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    fn insert(&self, id: String, entry: Arc<T>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
    }

    fn remove(&self, id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn drain(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
pub struct InMemoryConnection {
    id: String,
    broker: Arc<InMemoryBroker>,
    closed: AtomicBool,
    sessions: Arc<Registry<InMemorySession>>,
}

impl InMemoryConnection {
    pub fn open_session(&self) -> Result<Arc<InMemorySession>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        let session = Arc::new(InMemorySession {
            id: format!("session-{}", Uuid::new_v4()),
            broker: self.broker.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            consumers: Arc::new(Registry::default()),
            owner: Arc::downgrade(&self.sessions),
        });
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Sessions created here and not closed yet.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl BrokerConnection for InMemoryConnection {
    fn start(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("connection"));
        }
        trace!(connection = %self.id, "started in-memory connection");
        Ok(())
    }

    fn create_session(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        Ok(self.open_session()?)
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for session in self.sessions.drain() {
            session.close()?;
        }
        debug!(connection = %self.id, "closed in-memory connection");
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemorySession {
    id: String,
    broker: Arc<InMemoryBroker>,
    closed: Arc<AtomicBool>,
    consumers: Arc<Registry<ConsumerShared>>,
    owner: Weak<Registry<InMemorySession>>,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed("session"))
        } else {
            Ok(())
        }
    }

    /// Consumers created here and not closed yet.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}

impl BrokerSession for InMemorySession {
    fn create_destination(&self, endpoint: &Endpoint) -> Result<Destination, TransportError> {
        self.ensure_open()?;
        Ok(self.broker.declare(endpoint))
    }

    fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, TransportError> {
        self.ensure_open()?;
        Ok(Box::new(InMemoryProducer {
            destination: destination.clone(),
            broker: self.broker.clone(),
            session_closed: self.closed.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, TransportError> {
        self.ensure_open()?;
        let selector = selector.map(MessageSelector::parse).transpose()?;
        let (id, receiver) = self.broker.subscribe(destination, selector)?;
        let shared = Arc::new(ConsumerShared {
            id,
            destination: destination.clone(),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
            receiver: Mutex::new(Some(receiver)),
            owner: Arc::downgrade(&self.consumers),
        });
        self.consumers.insert(shared.id.clone(), shared.clone());
        Ok(Box::new(InMemoryConsumer { shared }))
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(&self.id);
        }
        for consumer in self.consumers.drain() {
            consumer.close();
        }
        Ok(())
    }
}

#[derive(Debug)]
struct InMemoryProducer {
    destination: Destination,
    broker: Arc<InMemoryBroker>,
    session_closed: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MessageProducer for InMemoryProducer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn send(&self, message: TransportMessage) -> Result<MessageId, TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.session_closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("producer"));
        }
        self.broker.publish(&self.destination, message)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct ConsumerShared {
    id: SubscriberId,
    destination: Destination,
    broker: Arc<InMemoryBroker>,
    closed: AtomicBool,
    receiver: Mutex<Option<UnboundedReceiver<TransportMessage>>>,
    owner: Weak<Registry<ConsumerShared>>,
}

impl ConsumerShared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(&self.id);
        }
        self.broker.unsubscribe(&self.destination, &self.id);
        // Nothing is listening, so whatever was routed here goes back.
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut receiver) = receiver {
            while let Ok(message) = receiver.try_recv() {
                self.broker.redeliver(&self.destination, message);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct InMemoryConsumer {
    shared: Arc<ConsumerShared>,
}

impl MessageConsumer for InMemoryConsumer {
    fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    fn set_listener(&self, listener: Arc<dyn DeliveryListener>) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed("consumer"));
        }
        let mut receiver = self
            .shared
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Other("consumer already has a listener".to_string()))?;

        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("cmdbus-delivery-{}", self.shared.destination.name()))
            .spawn(move || {
                while let Some(message) = receiver.blocking_recv() {
                    if shared.is_closed() {
                        shared.broker.redeliver(&shared.destination, message);
                        continue;
                    }
                    listener.on_delivery(message);
                }
                trace!(destination = %shared.destination, "delivery thread finished");
            })
            .map_err(|e| TransportError::Other(format!("cannot start delivery thread: {e}")))?;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.shared.close();
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        self.shared.close();
    }
}
