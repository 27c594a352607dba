//! The `broker` module is the seam between `cmdbus` and a message broker.
//!
//! The traits here are the handful of broker operations the rest of the
//! crate relies on: connections, sessions, destinations, producers, and
//! consumers with push-style delivery. [`InMemoryBroker`] implements them
//! in-process and is what the binary and the tests run against.

pub mod engine;
pub mod memory;
pub mod selector;
pub mod topic;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::message::MessageId;
use crate::utils::error::TransportError;

pub use engine::InMemoryBroker;
pub use memory::InMemoryConnectionFactory;
pub use selector::MessageSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl DestinationKind {
    fn scheme(self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
        }
    }
}

/// Where a context should point, before the broker has resolved it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    kind: DestinationKind,
    name: String,
    temporary: bool,
}

impl Endpoint {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
            temporary: false,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
            temporary: false,
        }
    }

    /// A broker-named queue that lives as long as its consumers.
    pub fn temporary_queue() -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: String::new(),
            temporary: true,
        }
    }

    pub fn temporary_topic() -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: String::new(),
            temporary: true,
        }
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.temporary {
            write!(f, "{}://$TEMPORARY$", self.kind.scheme())
        } else {
            write!(f, "{}://{}", self.kind.scheme(), self.name)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// Parses `queue://name` or `topic://name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let (scheme, name) = s.split_once("://").ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }
        match scheme.to_ascii_lowercase().as_str() {
            "queue" => Ok(Endpoint::queue(name)),
            "topic" => Ok(Endpoint::topic(name)),
            _ => Err(invalid()),
        }
    }
}

/// A destination the broker has resolved. This is what travels in the
/// reply-to field of a transport message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
    temporary: bool,
}

impl Destination {
    pub(crate) fn new(kind: DestinationKind, name: impl Into<String>, temporary: bool) -> Self {
        Self {
            kind,
            name: name.into(),
            temporary,
        }
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Bytes(Vec<u8>),
}

/// A message as the broker sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<MessageId>,
    pub reply_to: Option<Destination>,
    /// Milliseconds since the epoch, set by the broker on publish.
    pub timestamp: Option<i64>,
    pub properties: HashMap<String, String>,
    pub body: Body,
}

impl TransportMessage {
    pub fn new(body: Body) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            reply_to: None,
            timestamp: None,
            properties: HashMap::new(),
            body,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Body::Text(text.into()))
    }

    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::new(Body::Bytes(bytes))
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

pub trait ConnectionFactory: Send + Sync {
    fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

pub trait BrokerConnection: Send + Sync {
    /// Starts delivery to the consumers of this connection.
    fn start(&self) -> Result<(), TransportError>;

    fn create_session(&self) -> Result<Arc<dyn BrokerSession>, TransportError>;

    /// Closes the connection and every session created from it.
    fn close(&self) -> Result<(), TransportError>;
}

pub trait BrokerSession: Send + Sync {
    fn create_destination(&self, endpoint: &Endpoint) -> Result<Destination, TransportError>;

    fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, TransportError>;

    fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, TransportError>;

    /// Closes the session and every producer and consumer created from it.
    fn close(&self) -> Result<(), TransportError>;
}

pub trait MessageProducer: Send + Sync {
    fn destination(&self) -> &Destination;

    /// Publishes synchronously and returns the id the broker assigned.
    fn send(&self, message: TransportMessage) -> Result<MessageId, TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

pub trait MessageConsumer: Send + Sync {
    fn destination(&self) -> &Destination;

    /// Starts push delivery; a consumer accepts one listener.
    fn set_listener(&self, listener: Arc<dyn DeliveryListener>) -> Result<(), TransportError>;

    fn close(&self) -> Result<(), TransportError>;
}

/// Receives messages on the consumer's delivery thread.
pub trait DeliveryListener: Send + Sync {
    fn on_delivery(&self, message: TransportMessage);
}
