//! The `message` module defines what travels over the bus and the gateway.
//!
//! Every concrete message type implements [`BasicMessage`]: it is a plain
//! serde struct plus a short type name used as the envelope tag. Code that
//! must handle messages without knowing their type at compile time works
//! with the object-safe [`AnyMessage`] view, which every `BasicMessage`
//! gets for free.
//!
//! Transport metadata (ids, headers, reply-to) is never part of the JSON
//! body; it lives next to the body in [`MessageMeta`].

pub mod api;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::broker::Destination;

pub use api::{
    Authentication, EchoRequest, EchoResponse, ExecuteOperationRequest, ExecuteOperationResponse,
    FeedWebSocketClosedEvent, GenericErrorResponse, GenericSuccessResponse, SimpleBasicMessage,
    WelcomeResponse,
};

/// Broker-assigned, opaque message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Returns `None` for an empty id.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() { None } else { Some(Self(id)) }
    }

    /// A fresh `ID:<uuid>` identifier.
    pub fn random() -> Self {
        Self(format!("ID:{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A concrete message type that can be carried in an envelope.
///
/// The three capability hooks default to "absent". Types that carry a
/// session origin, a UI session destination, or a feed destination override
/// the matching hook.
pub trait BasicMessage: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Short type name, used as the envelope tag.
    const TYPE_NAME: &'static str;

    /// Slot holding the id of the UI session the message came from.
    fn sender_session_id_mut(&mut self) -> Option<&mut Option<String>> {
        None
    }

    /// The UI session the message must be delivered to.
    fn destination_session_id(&self) -> Option<&str> {
        None
    }

    /// The feed the message must be delivered to.
    fn destination_feed_id(&self) -> Option<&str> {
        None
    }
}

/// Object-safe view over any [`BasicMessage`].
pub trait AnyMessage: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn to_json(&self) -> serde_json::Result<String>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn session_origin_mut(&mut self) -> Option<&mut Option<String>>;
    fn ui_session_destination(&self) -> Option<&str>;
    fn feed_destination(&self) -> Option<&str>;
}

impl<T: BasicMessage> AnyMessage for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn session_origin_mut(&mut self) -> Option<&mut Option<String>> {
        BasicMessage::sender_session_id_mut(self)
    }

    fn ui_session_destination(&self) -> Option<&str> {
        BasicMessage::destination_session_id(self)
    }

    fn feed_destination(&self) -> Option<&str> {
        BasicMessage::destination_feed_id(self)
    }
}

/// Lets the processor send both typed and type-erased bodies.
pub trait MessageBody: Send {
    fn as_dyn(&self) -> &dyn AnyMessage;
}

impl<T: BasicMessage> MessageBody for T {
    fn as_dyn(&self) -> &dyn AnyMessage {
        self
    }
}

impl MessageBody for Box<dyn AnyMessage> {
    fn as_dyn(&self) -> &dyn AnyMessage {
        self.as_ref()
    }
}

/// The message type a listener is willing to receive.
///
/// A listener that names a concrete `BasicMessage` gets only that type; one
/// that names `Box<dyn AnyMessage>` accepts whatever the registry decodes.
pub trait FromDecoded: Sized + Send + 'static {
    fn expected_type() -> &'static str;

    /// Hands the message back when it is not of the expected type.
    fn from_decoded(message: Box<dyn AnyMessage>) -> Result<Self, Box<dyn AnyMessage>>;
}

impl<T: BasicMessage> FromDecoded for T {
    fn expected_type() -> &'static str {
        T::TYPE_NAME
    }

    fn from_decoded(message: Box<dyn AnyMessage>) -> Result<Self, Box<dyn AnyMessage>> {
        if !message.as_any().is::<T>() {
            return Err(message);
        }
        match message.into_any().downcast::<T>() {
            Ok(typed) => Ok(*typed),
            Err(_) => unreachable!("message type checked above"),
        }
    }
}

impl FromDecoded for Box<dyn AnyMessage> {
    fn expected_type() -> &'static str {
        "any"
    }

    fn from_decoded(message: Box<dyn AnyMessage>) -> Result<Self, Box<dyn AnyMessage>> {
        Ok(message)
    }
}

/// Transport metadata carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMeta {
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<MessageId>,
    pub headers: HashMap<String, String>,
    pub reply_to: Option<Destination>,
}

#[derive(Debug)]
pub struct Message<M> {
    pub body: M,
    pub meta: MessageMeta,
}

pub type DynMessage = Message<Box<dyn AnyMessage>>;

impl<M> Message<M> {
    pub fn new(body: M) -> Self {
        Self {
            body,
            meta: MessageMeta::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.headers.insert(name.into(), value.into());
        self
    }

    pub fn correlated_with(mut self, id: MessageId) -> Self {
        self.meta.correlation_id = Some(id);
        self
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.meta.message_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&MessageId> {
        self.meta.correlation_id.as_ref()
    }
}

impl DynMessage {
    /// Converts into a typed message, or gives the message back untouched.
    pub fn downcast<T: BasicMessage>(self) -> Result<Message<T>, DynMessage> {
        let Message { body, meta } = self;
        match T::from_decoded(body) {
            Ok(body) => Ok(Message { body, meta }),
            Err(body) => Err(Message { body, meta }),
        }
    }
}
