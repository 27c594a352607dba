use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize, Serializer};

use super::*;
use crate::broker::{Destination, Endpoint, InMemoryBroker};
use crate::context::ConnectionContextFactory;
use crate::message::{BasicMessage, EchoRequest, SimpleBasicMessage};
use crate::utils::error::TransportError;

const WAIT: Duration = Duration::from_secs(5);

struct Collect<M>(Sender<Delivery<M>>);

impl<M: crate::message::FromDecoded> MessageListener for Collect<M> {
    type Message = M;

    fn on_message(&self, delivery: Delivery<M>) {
        let _ = self.0.send(delivery);
    }
}

struct PanicsOnBoom(Sender<String>);

impl MessageListener for PanicsOnBoom {
    type Message = SimpleBasicMessage;

    fn on_message(&self, delivery: Delivery<SimpleBasicMessage>) {
        if delivery.body().message == "boom" {
            panic!("listener blew up");
        }
        let _ = self.0.send(delivery.message.body.message);
    }
}

/// Echoes the request back, recording where the reply went.
struct EchoHandler {
    reply_to: Sender<Option<Destination>>,
}

impl RpcHandler for EchoHandler {
    type Request = SimpleBasicMessage;
    type Response = SimpleBasicMessage;

    fn on_request(&self, request: Delivery<SimpleBasicMessage>) -> Option<SimpleBasicMessage> {
        let _ = self.reply_to.send(request.meta().reply_to.clone());
        Some(SimpleBasicMessage::new(format!(
            "ECHO! {}",
            request.body().message
        )))
    }
}

/// Answers with its own name in front of the request.
struct NamedResponder(&'static str);

impl RpcHandler for NamedResponder {
    type Request = SimpleBasicMessage;
    type Response = SimpleBasicMessage;

    fn on_request(&self, request: Delivery<SimpleBasicMessage>) -> Option<SimpleBasicMessage> {
        Some(SimpleBasicMessage::new(format!("{}: {}", self.0, request.body().message)))
    }
}

/// A message whose body cannot be serialized.
#[derive(Debug, Deserialize)]
struct Unencodable {}

impl Serialize for Unencodable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("refuses to encode"))
    }
}

impl BasicMessage for Unencodable {
    const TYPE_NAME: &'static str = "Unencodable";
}

fn contexts(broker: &Arc<InMemoryBroker>) -> ConnectionContextFactory {
    ConnectionContextFactory::new(Arc::new(broker.connection_factory()))
}

fn start_echo_server(
    broker: &Arc<InMemoryBroker>,
    queue: &str,
) -> (ConsumerContext, mpsc::Receiver<Option<Destination>>) {
    let context = contexts(broker)
        .create_consumer_context(&Endpoint::queue(queue), None)
        .unwrap();
    let (tx, rx) = mpsc::channel();
    MessageProcessor::default()
        .listen_rpc(&context, EchoHandler { reply_to: tx })
        .unwrap();
    (context, rx)
}

#[test]
fn send_copies_headers_and_correlation() {
    let broker = InMemoryBroker::new();
    let factory = contexts(&broker);
    let consumer = factory
        .create_consumer_context(&Endpoint::queue("Plain"), None)
        .unwrap();
    let producer = factory.create_producer_context(&Endpoint::queue("Plain")).unwrap();
    let processor = MessageProcessor::default();

    let (tx, rx) = mpsc::channel();
    processor
        .listen(&consumer, Collect::<SimpleBasicMessage>(tx))
        .unwrap();

    let mut message = Message::new(SimpleBasicMessage::new("hello"))
        .with_header("a", "from-message")
        .with_header("b", "kept")
        .correlated_with(MessageId::new("ID:request").unwrap());
    message.meta.message_id = MessageId::new("ID:preset");
    let explicit: HashMap<String, String> =
        [("a".to_string(), "explicit".to_string())].into_iter().collect();

    let id = processor.send(&producer, &message, Some(&explicit)).unwrap();
    assert_ne!(id.as_str(), "ID:preset");

    let delivery = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.body().message, "hello");
    assert_eq!(delivery.meta().message_id.as_ref(), Some(&id));
    assert_eq!(
        delivery.meta().correlation_id.as_ref().map(MessageId::as_str),
        Some("ID:request")
    );
    assert_eq!(delivery.meta().headers["a"], "explicit");
    assert_eq!(delivery.meta().headers["b"], "kept");
    assert!(delivery.attachment.is_none());
}

#[test]
fn attachment_travels_in_a_binary_body() {
    let broker = InMemoryBroker::new();
    let factory = contexts(&broker);
    let consumer = factory
        .create_consumer_context(&Endpoint::queue("Binary"), None)
        .unwrap();
    let producer = factory.create_producer_context(&Endpoint::queue("Binary")).unwrap();
    let processor = MessageProcessor::default();

    let (tx, rx) = mpsc::channel();
    processor
        .listen(&consumer, Collect::<EchoRequest>(tx))
        .unwrap();
    processor
        .send_with_attachment(
            &producer,
            &Message::new(EchoRequest::new("with bytes")),
            Cursor::new(b"deadbeef".to_vec()),
            None,
        )
        .unwrap();

    let delivery = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.body().echo_message, "with bytes");
    let bytes = delivery.attachment.unwrap().read_to_vec().unwrap();
    assert_eq!(bytes, b"deadbeef");
}

#[test]
fn listener_only_sees_its_declared_type() {
    let broker = InMemoryBroker::new();
    let factory = contexts(&broker);
    let consumer = factory
        .create_consumer_context(&Endpoint::topic("Mixed"), None)
        .unwrap();
    let producer = factory.create_producer_context(&Endpoint::topic("Mixed")).unwrap();
    let processor = MessageProcessor::default();

    let (tx, rx) = mpsc::channel();
    processor
        .listen(&consumer, Collect::<EchoRequest>(tx))
        .unwrap();
    processor
        .send(&producer, &Message::new(SimpleBasicMessage::new("ignored")), None)
        .unwrap();
    processor
        .send(&producer, &Message::new(EchoRequest::new("wanted")), None)
        .unwrap();

    let delivery = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.body().echo_message, "wanted");
}

#[test]
fn any_message_listener_accepts_everything() {
    let broker = InMemoryBroker::new();
    let factory = contexts(&broker);
    let consumer = factory
        .create_consumer_context(&Endpoint::queue("Any"), None)
        .unwrap();
    let producer = factory.create_producer_context(&Endpoint::queue("Any")).unwrap();
    let processor = MessageProcessor::default();

    let (tx, rx) = mpsc::channel();
    processor
        .listen(&consumer, Collect::<Box<dyn crate::message::AnyMessage>>(tx))
        .unwrap();
    processor
        .send(&producer, &Message::new(EchoRequest::new("x")), None)
        .unwrap();

    let delivery = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(delivery.body().type_name(), "EchoRequest");
}

#[test]
fn panicking_listener_keeps_delivery_alive() {
    let broker = InMemoryBroker::new();
    let factory = contexts(&broker);
    let consumer = factory
        .create_consumer_context(&Endpoint::queue("Fragile"), None)
        .unwrap();
    let producer = factory.create_producer_context(&Endpoint::queue("Fragile")).unwrap();
    let processor = MessageProcessor::default();

    let (tx, rx) = mpsc::channel();
    processor.listen(&consumer, PanicsOnBoom(tx)).unwrap();
    for text in ["boom", "after"] {
        processor
            .send(&producer, &Message::new(SimpleBasicMessage::new(text)), None)
            .unwrap();
    }
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "after");
}

#[test]
fn send_on_closed_context_fails() {
    let broker = InMemoryBroker::new();
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Closed"))
        .unwrap();
    producer.close();
    let err = MessageProcessor::default()
        .send(&producer, &Message::new(SimpleBasicMessage::new("x")), None)
        .unwrap_err();
    assert!(matches!(err, BusError::Transport(TransportError::Closed(_))));
}

#[tokio::test]
async fn rpc_round_trip_echoes() {
    let broker = InMemoryBroker::new();
    let (_server, reply_to) = start_echo_server(&broker, "EchoService");
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("EchoService"))
        .unwrap();

    let response = MessageProcessor::default()
        .send_rpc::<SimpleBasicMessage, _>(
            &producer,
            &Message::new(SimpleBasicMessage::new("hi")),
            None,
        )
        .with_timeout(Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(response.body().message, "ECHO! hi");

    // The temporary response queue goes away once the round trip is over.
    let reply_to = reply_to.recv_timeout(WAIT).unwrap().unwrap();
    assert!(reply_to.is_temporary());
    let deadline = Instant::now() + WAIT;
    while broker.has_destination(&reply_to) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!broker.has_destination(&reply_to));
}

#[tokio::test]
async fn rpc_response_is_correlated_with_request() {
    let broker = InMemoryBroker::new();
    let (_server, _reply_to) = start_echo_server(&broker, "Correlated");
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Correlated"))
        .unwrap();
    let processor = MessageProcessor::default();

    let response = processor
        .send_rpc::<SimpleBasicMessage, _>(
            &producer,
            &Message::new(SimpleBasicMessage::new("who")),
            None,
        )
        .with_timeout(WAIT)
        .await
        .unwrap();
    assert!(response.meta().correlation_id.is_some());
    assert_ne!(response.meta().correlation_id, response.meta().message_id);
}

#[tokio::test]
async fn rpc_without_responder_times_out_and_cleans_up() {
    let broker = InMemoryBroker::new();
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Nobody"))
        .unwrap();

    let started = Instant::now();
    let err = MessageProcessor::default()
        .send_rpc::<SimpleBasicMessage, _>(
            &producer,
            &Message::new(SimpleBasicMessage::new("anyone?")),
            None,
        )
        .with_timeout(Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(200));

    // The request is still queued; its reply-to queue no longer exists.
    assert_eq!(broker.pending_count("Nobody"), 1);
    let reply_to = queued_reply_to(&broker, "Nobody");
    assert!(reply_to.is_temporary());
    assert!(!broker.has_destination(&reply_to));
    assert_eq!(broker.temporary_count(), 0);
}

/// Takes the request waiting on `queue` and returns its reply-to.
fn queued_reply_to(broker: &Arc<InMemoryBroker>, queue: &str) -> Destination {
    let consumer = contexts(broker)
        .create_consumer_context(&Endpoint::queue(queue), None)
        .unwrap();
    let (tx, rx) = mpsc::channel();
    MessageProcessor::default()
        .listen(&consumer, Collect::<SimpleBasicMessage>(tx))
        .unwrap();
    let delivery = rx.recv_timeout(WAIT).unwrap();
    delivery.meta().reply_to.clone().expect("request has no reply-to")
}

#[tokio::test]
async fn rpc_setup_failure_yields_failed_future() {
    let broker = InMemoryBroker::new();
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Gone"))
        .unwrap();
    producer.close();

    let future = MessageProcessor::default().send_rpc::<SimpleBasicMessage, _>(
        &producer,
        &Message::new(SimpleBasicMessage::new("x")),
        None,
    );
    let err = future.await.unwrap_err();
    assert!(matches!(err, BusError::Transport(_)));
}

#[tokio::test]
async fn undecodable_request_gets_an_error_response() {
    let broker = InMemoryBroker::new();
    let (_server, reply_to) = start_echo_server(&broker, "Strict");
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Strict"))
        .unwrap();

    // The echo server only understands SimpleBasicMessage.
    let err = MessageProcessor::default()
        .send_rpc::<SimpleBasicMessage, _>(&producer, &Message::new(EchoRequest::new("x")), None)
        .with_timeout(WAIT)
        .await
        .unwrap_err();
    match err {
        BusError::Remote(message) => assert_eq!(message, "Failed to decode request"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(reply_to.try_recv().is_err());
}

#[tokio::test]
async fn request_without_reply_to_gets_no_response() {
    let broker = InMemoryBroker::new();
    let (_server, reply_to) = start_echo_server(&broker, "FireAndForget");
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("FireAndForget"))
        .unwrap();

    MessageProcessor::default()
        .send(&producer, &Message::new(SimpleBasicMessage::new("x")), None)
        .unwrap();
    assert_eq!(reply_to.recv_timeout(WAIT).unwrap(), None);
}

#[tokio::test]
async fn dropping_the_future_cancels_the_request() {
    let broker = InMemoryBroker::new();
    let (_server, reply_to) = start_echo_server(&broker, "Cancelled");
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Cancelled"))
        .unwrap();

    // No server is listening on the destination used here, so the request
    // stays queued while the future is dropped.
    let idle = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Idle"))
        .unwrap();
    let future = MessageProcessor::default().send_rpc::<SimpleBasicMessage, _>(
        &idle,
        &Message::new(SimpleBasicMessage::new("x")),
        None,
    );
    drop(future);
    assert_eq!(broker.pending_count("Idle"), 1);
    let dropped_reply_to = queued_reply_to(&broker, "Idle");
    assert!(!broker.has_destination(&dropped_reply_to));

    // The processor keeps working for other requests.
    let response = MessageProcessor::default()
        .send_rpc::<SimpleBasicMessage, _>(
            &producer,
            &Message::new(SimpleBasicMessage::new("still here")),
            None,
        )
        .with_timeout(WAIT)
        .await
        .unwrap();
    assert_eq!(response.body().message, "ECHO! still here");
    assert!(reply_to.recv_timeout(WAIT).unwrap().is_some());
}

#[tokio::test]
async fn unencodable_request_leaves_nothing_behind() {
    let broker = InMemoryBroker::new();
    let producer = contexts(&broker)
        .create_producer_context(&Endpoint::queue("Unencodable"))
        .unwrap();
    let processor = MessageProcessor::default();

    let err = processor
        .send_rpc::<SimpleBasicMessage, _>(&producer, &Message::new(Unencodable {}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Encode(_)));

    let (tx, _rx) = mpsc::channel();
    let err = processor
        .send_and_listen(
            &producer,
            &Message::new(Unencodable {}),
            Collect::<SimpleBasicMessage>(tx),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, BusError::Encode(_)));

    assert_eq!(broker.temporary_count(), 0);
    assert_eq!(broker.pending_count("Unencodable"), 0);
}

#[test]
fn send_and_listen_streams_every_response_until_closed() {
    let broker = InMemoryBroker::new();
    let factory = contexts(&broker);
    let processor = MessageProcessor::default();

    // Both responders subscribe to the topic, so one request gets two answers.
    let responders: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|name| {
            let context = factory
                .create_consumer_context(&Endpoint::topic("Census"), None)
                .unwrap();
            processor.listen_rpc(&context, NamedResponder(name)).unwrap();
            context
        })
        .collect();
    let producer = factory.create_producer_context(&Endpoint::topic("Census")).unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = processor
        .send_and_listen(
            &producer,
            &Message::new(SimpleBasicMessage::new("ping")),
            Collect::<SimpleBasicMessage>(tx),
            None,
        )
        .unwrap();
    assert!(handle.reply_to().is_temporary());

    let mut answers = Vec::new();
    for _ in 0..2 {
        let delivery = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(delivery.meta().correlation_id.as_ref(), Some(handle.request_id()));
        answers.push(delivery.message.body.message);
    }
    answers.sort();
    assert_eq!(answers, vec!["left: ping", "right: ping"]);
    assert!(broker.has_destination(handle.reply_to()));

    handle.close();
    assert!(handle.is_closed());
    assert!(!broker.has_destination(handle.reply_to()));
    drop(responders);
}
