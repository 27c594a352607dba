use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::*;
use crate::broker::{
    DeliveryListener, DestinationKind, InMemoryBroker, MessageConsumer, MessageProducer,
    TransportMessage,
};
use crate::message::MessageId;

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default, Clone)]
struct Failures {
    start: bool,
    destination: bool,
    endpoint_close: bool,
    session_close: bool,
}

struct RecordingFactory {
    log: Log,
    failures: Failures,
    connections: AtomicUsize,
}

impl RecordingFactory {
    fn new(failures: Failures) -> Arc<Self> {
        Arc::new(Self {
            log: Arc::default(),
            failures,
            connections: AtomicUsize::new(0),
        })
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ConnectionFactory for RecordingFactory {
    fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingConnection {
            log: self.log.clone(),
            failures: self.failures.clone(),
        }))
    }
}

struct RecordingConnection {
    log: Log,
    failures: Failures,
}

impl BrokerConnection for RecordingConnection {
    fn start(&self) -> Result<(), TransportError> {
        if self.failures.start {
            return Err(TransportError::ConnectionFailed("refused".to_string()));
        }
        Ok(())
    }

    fn create_session(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        Ok(Arc::new(RecordingSession {
            log: self.log.clone(),
            failures: self.failures.clone(),
        }))
    }

    fn close(&self) -> Result<(), TransportError> {
        self.log.lock().unwrap().push("connection.close".to_string());
        Ok(())
    }
}

struct RecordingSession {
    log: Log,
    failures: Failures,
}

impl BrokerSession for RecordingSession {
    fn create_destination(&self, endpoint: &Endpoint) -> Result<Destination, TransportError> {
        if self.failures.destination {
            return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Destination::new(endpoint.kind(), endpoint.name(), false))
    }

    fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, TransportError> {
        Ok(Box::new(RecordingEndpoint {
            log: self.log.clone(),
            name: "producer",
            fail_close: self.failures.endpoint_close,
            destination: destination.clone(),
        }))
    }

    fn create_consumer(
        &self,
        destination: &Destination,
        _selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, TransportError> {
        Ok(Box::new(RecordingEndpoint {
            log: self.log.clone(),
            name: "consumer",
            fail_close: self.failures.endpoint_close,
            destination: destination.clone(),
        }))
    }

    fn close(&self) -> Result<(), TransportError> {
        self.log.lock().unwrap().push("session.close".to_string());
        if self.failures.session_close {
            return Err(TransportError::Other("session close failed".to_string()));
        }
        Ok(())
    }
}

struct RecordingEndpoint {
    log: Log,
    name: &'static str,
    fail_close: bool,
    destination: Destination,
}

impl RecordingEndpoint {
    fn record_close(&self) -> Result<(), TransportError> {
        self.log.lock().unwrap().push(format!("{}.close", self.name));
        if self.fail_close {
            return Err(TransportError::Other(format!("{} close failed", self.name)));
        }
        Ok(())
    }
}

impl MessageProducer for RecordingEndpoint {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn send(&self, _message: TransportMessage) -> Result<MessageId, TransportError> {
        Ok(MessageId::random())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.record_close()
    }
}

impl MessageConsumer for RecordingEndpoint {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn set_listener(&self, _listener: Arc<dyn DeliveryListener>) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.record_close()
    }
}

#[test]
fn producer_context_closes_in_order_once() {
    let factory = RecordingFactory::new(Failures::default());
    let context = ConnectionContextFactory::new(factory.clone())
        .create_producer_context(&Endpoint::queue("Orders"))
        .unwrap();
    assert!(context.owns_session());
    assert!(context.owns_connection());
    assert_eq!(context.destination().kind(), DestinationKind::Queue);

    context.close();
    context.close();
    assert!(context.is_closed());
    drop(context);

    assert_eq!(
        factory.entries(),
        vec!["producer.close", "session.close", "connection.close"]
    );
}

#[test]
fn drop_closes_consumer_context() {
    let factory = RecordingFactory::new(Failures::default());
    let context = ConnectionContextFactory::new(factory.clone())
        .create_consumer_context(&Endpoint::topic("Events"), Some("feedId = 'f'"))
        .unwrap();
    assert_eq!(context.selector(), Some("feedId = 'f'"));
    drop(context);
    assert_eq!(
        factory.entries(),
        vec!["consumer.close", "session.close", "connection.close"]
    );
}

#[test]
fn every_release_step_runs_despite_failures() {
    let factory = RecordingFactory::new(Failures {
        endpoint_close: true,
        session_close: true,
        ..Failures::default()
    });
    let context = ConnectionContextFactory::new(factory.clone())
        .create_producer_context(&Endpoint::queue("Orders"))
        .unwrap();
    context.close();
    assert_eq!(
        factory.entries(),
        vec!["producer.close", "session.close", "connection.close"]
    );
}

#[test]
fn reused_connection_belongs_to_the_factory() {
    let factory = RecordingFactory::new(Failures::default());
    let contexts = ConnectionContextFactory::new(factory.clone()).with_reuse_connection(true);
    let first = contexts
        .create_producer_context(&Endpoint::queue("A"))
        .unwrap();
    let second = contexts
        .create_consumer_context(&Endpoint::queue("B"), None)
        .unwrap();
    assert_eq!(factory.connections.load(Ordering::SeqCst), 1);
    assert!(!first.owns_connection());

    first.close();
    second.close();
    assert!(!factory.entries().contains(&"connection.close".to_string()));

    contexts.close();
    contexts.close();
    let closes = factory
        .entries()
        .into_iter()
        .filter(|entry| entry == "connection.close")
        .count();
    assert_eq!(closes, 1);
}

#[test]
fn derived_producer_closes_only_itself() {
    let factory = RecordingFactory::new(Failures::default());
    let consumer = ConnectionContextFactory::new(factory.clone())
        .create_consumer_context(&Endpoint::queue("Requests"), None)
        .unwrap();
    let reply_to = Destination::new(DestinationKind::Queue, "Replies", true);

    let producer = consumer.derive_producer(&reply_to).unwrap();
    assert!(!producer.owns_session());
    assert!(!producer.owns_connection());
    assert_eq!(producer.destination(), &reply_to);
    producer.close();

    assert_eq!(factory.entries(), vec!["producer.close"]);
    assert!(!consumer.is_closed());
}

#[test]
fn start_failure_closes_the_connection() {
    let factory = RecordingFactory::new(Failures {
        start: true,
        ..Failures::default()
    });
    let err = ConnectionContextFactory::new(factory.clone())
        .create_producer_context(&Endpoint::queue("Orders"))
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
    assert_eq!(factory.entries(), vec!["connection.close"]);
}

#[test]
fn partial_creation_releases_what_was_built() {
    let factory = RecordingFactory::new(Failures {
        destination: true,
        ..Failures::default()
    });
    let err = ConnectionContextFactory::new(factory.clone())
        .create_consumer_context(&Endpoint::queue("Orders"), None)
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    assert_eq!(factory.entries(), vec!["session.close", "connection.close"]);
}

#[test]
fn in_memory_consumer_context_releases_subscription() {
    let broker = InMemoryBroker::new();
    let contexts = ConnectionContextFactory::new(Arc::new(broker.connection_factory()));
    let context = contexts
        .create_consumer_context(&Endpoint::queue("FeedCommandQueue"), Some("feedId = 'f1'"))
        .unwrap();
    let destination = context.destination().clone();
    assert_eq!(broker.consumer_count(&destination), 1);

    drop(context);
    assert_eq!(broker.consumer_count(&destination), 0);
}
