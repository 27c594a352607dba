//! The `processor` module sends and receives messages through contexts.
//!
//! [`MessageProcessor`] encodes messages onto a producer context, registers
//! listeners on consumer contexts, and implements request/response on top
//! of both (see [`rpc`]).

pub mod listener;
pub mod rpc;

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::broker::{Body, TransportMessage};
use crate::codec::Codec;
use crate::context::{ConsumerContext, ProducerContext};
use crate::message::{Message, MessageBody, MessageId};
use crate::utils::error::BusError;

pub use listener::{Delivery, MessageListener};
pub use rpc::{RpcConsumerHandle, RpcFuture, RpcHandler};

use listener::ListenerAdapter;

#[derive(Debug, Clone)]
pub struct MessageProcessor {
    codec: Arc<Codec>,
}

impl Default for MessageProcessor {
    fn default() -> Self {
        Self::new(Arc::new(Codec::default()))
    }
}

impl MessageProcessor {
    pub fn new(codec: Arc<Codec>) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// Publishes `message` and returns the id the broker assigned.
    ///
    /// The message's own headers are copied first, then `headers`, so an
    /// explicit header wins over one carried by the message.
    pub fn send<M: MessageBody>(
        &self,
        context: &ProducerContext,
        message: &Message<M>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<MessageId, BusError> {
        let transport = self.transport_message(message, headers)?;
        self.publish(context, transport, message.body.as_dyn().type_name())
    }

    /// Like [`MessageProcessor::send`], with the attachment appended to the
    /// envelope in a binary body.
    pub fn send_with_attachment<M: MessageBody, R: Read>(
        &self,
        context: &ProducerContext,
        message: &Message<M>,
        attachment: R,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<MessageId, BusError> {
        let mut transport = self.transport_message(message, headers)?;
        transport.body = Body::Bytes(Codec::encode_with_attachment(
            message.body.as_dyn(),
            attachment,
        )?);
        self.publish(context, transport, message.body.as_dyn().type_name())
    }

    /// Registers `listener` on the context's consumer and returns at once.
    pub fn listen<L: MessageListener>(
        &self,
        context: &ConsumerContext,
        listener: L,
    ) -> Result<(), BusError> {
        let adapter = ListenerAdapter {
            codec: self.codec.clone(),
            destination: context.destination().clone(),
            listener,
        };
        context.consumer().set_listener(Arc::new(adapter))?;
        debug!(destination = %context.destination(), "listening");
        Ok(())
    }

    fn transport_message<M: MessageBody>(
        &self,
        message: &Message<M>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<TransportMessage, BusError> {
        if let Some(id) = &message.meta.message_id {
            debug!(message_id = %id, "ignoring preset message id; the broker assigns a new one");
        }
        let mut transport = TransportMessage::text(Codec::encode(message.body.as_dyn())?);
        transport.correlation_id = message.meta.correlation_id.clone();
        transport.reply_to = message.meta.reply_to.clone();
        transport.properties = message.meta.headers.clone();
        if let Some(headers) = headers {
            transport
                .properties
                .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(transport)
    }

    fn publish(
        &self,
        context: &ProducerContext,
        transport: TransportMessage,
        type_name: &str,
    ) -> Result<MessageId, BusError> {
        let id = context.producer().send(transport)?;
        trace!(
            destination = %context.destination(),
            message_id = %id,
            type_name,
            "sent message"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests;
