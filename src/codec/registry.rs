use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;

use crate::message::{
    AnyMessage, Authentication, BasicMessage, EchoRequest, EchoResponse, ExecuteOperationRequest,
    ExecuteOperationResponse, FeedWebSocketClosedEvent, GenericErrorResponse,
    GenericSuccessResponse, SimpleBasicMessage, WelcomeResponse,
};
use crate::utils::error::DecodeError;

/// Namespace unqualified type names are resolved against.
pub const DEFAULT_NAMESPACE: &str = "cmdbus.api";

type StrDecoder = fn(&str) -> serde_json::Result<Box<dyn AnyMessage>>;
type ReaderDecoder = fn(&mut dyn Read) -> serde_json::Result<Box<dyn AnyMessage>>;

#[derive(Debug, Clone)]
pub(crate) struct Decoder {
    pub qualified_name: String,
    pub from_str: StrDecoder,
    pub from_reader: ReaderDecoder,
}

/// Closed table from qualified type name to decoder.
///
/// Only registered types can ever be instantiated from an envelope.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    default_namespace: String,
    decoders: HashMap<String, Decoder>,
}

impl TypeRegistry {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            decoders: HashMap::new(),
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Registers `T` under the default namespace.
    pub fn register<T: BasicMessage>(&mut self) -> &mut Self {
        let namespace = self.default_namespace.clone();
        self.register_in::<T>(&namespace)
    }

    pub fn register_in<T: BasicMessage>(&mut self, namespace: &str) -> &mut Self {
        let qualified_name = format!("{namespace}.{}", T::TYPE_NAME);
        self.decoders.insert(
            qualified_name.clone(),
            Decoder {
                qualified_name,
                from_str: decode_str::<T>,
                from_reader: decode_reader::<T>,
            },
        );
        self
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(&*self.qualify(type_name))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub(crate) fn resolve(&self, type_name: &str) -> Result<&Decoder, DecodeError> {
        let qualified = self.qualify(type_name);
        self.decoders
            .get(&*qualified)
            .ok_or_else(|| DecodeError::UnknownType(qualified.into_owned()))
    }

    fn qualify<'a>(&self, type_name: &'a str) -> Cow<'a, str> {
        if type_name.contains('.') {
            Cow::Borrowed(type_name)
        } else {
            Cow::Owned(format!("{}.{type_name}", self.default_namespace))
        }
    }
}

/// Registry holding every message type in [`crate::message::api`].
pub fn default_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new(DEFAULT_NAMESPACE);
    registry
        .register::<SimpleBasicMessage>()
        .register::<Authentication>()
        .register::<EchoRequest>()
        .register::<EchoResponse>()
        .register::<GenericSuccessResponse>()
        .register::<GenericErrorResponse>()
        .register::<WelcomeResponse>()
        .register::<ExecuteOperationRequest>()
        .register::<ExecuteOperationResponse>()
        .register::<FeedWebSocketClosedEvent>();
    registry
}

fn decode_str<T: BasicMessage>(json: &str) -> serde_json::Result<Box<dyn AnyMessage>> {
    Ok(Box::new(serde_json::from_str::<T>(json)?))
}

// serde_json pulls one byte at a time from a reader and does not look past
// the closing brace of a top-level object, so the reader is left positioned
// on the first attachment byte.
fn decode_reader<T: BasicMessage>(reader: &mut dyn Read) -> serde_json::Result<Box<dyn AnyMessage>> {
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    Ok(Box::new(T::deserialize(&mut deserializer)?))
}
