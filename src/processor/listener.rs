use std::io::{Cursor, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{error, warn};

use crate::broker::{Body, DeliveryListener, Destination, TransportMessage};
use crate::codec::{self, BinaryData, Codec};
use crate::message::{FromDecoded, Message, MessageMeta};
use crate::utils::error::DecodeError;

/// A decoded message together with the attachment it arrived with.
#[derive(Debug)]
pub struct Delivery<M> {
    pub message: Message<M>,
    pub attachment: Option<BinaryData>,
}

impl<M> Delivery<M> {
    pub fn body(&self) -> &M {
        &self.message.body
    }

    pub fn meta(&self) -> &MessageMeta {
        &self.message.meta
    }
}

/// Receives decoded messages from a consumer context.
///
/// `Message` declares what the listener accepts; deliveries of any other
/// type are logged and dropped before `on_message` is called.
pub trait MessageListener: Send + Sync + 'static {
    type Message: FromDecoded;

    fn on_message(&self, delivery: Delivery<Self::Message>);
}

pub(crate) fn decode_delivery<M: FromDecoded>(
    codec: &Codec,
    transport: TransportMessage,
) -> Result<Delivery<M>, DecodeError> {
    let TransportMessage {
        message_id,
        correlation_id,
        reply_to,
        properties,
        body,
        ..
    } = transport;

    let (body, attachment) = match body {
        Body::Text(text) => (codec.decode(&text)?, None),
        Body::Bytes(bytes) => {
            let reader: Box<dyn Read + Send> = Box::new(Cursor::new(bytes));
            let (message, attachment) = codec.decode_stream(reader)?;
            (message, Some(attachment))
        }
    };

    Ok(Delivery {
        message: Message {
            body: codec::convert::<M>(body)?,
            meta: MessageMeta {
                message_id,
                correlation_id,
                headers: properties,
                reply_to,
            },
        },
        attachment,
    })
}

/// Bridges raw broker deliveries to a [`MessageListener`].
pub(crate) struct ListenerAdapter<L> {
    pub codec: Arc<Codec>,
    pub destination: Destination,
    pub listener: L,
}

impl<L: MessageListener> DeliveryListener for ListenerAdapter<L> {
    fn on_delivery(&self, message: TransportMessage) {
        let message_id = message.message_id.clone();
        let delivery = match decode_delivery::<L::Message>(&self.codec, message) {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(
                    destination = %self.destination,
                    message_id = ?message_id,
                    error = %e,
                    "dropping message that cannot be decoded"
                );
                return;
            }
        };
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_message(delivery))).is_err() {
            error!(
                destination = %self.destination,
                message_id = ?message_id,
                "message listener panicked"
            );
        }
    }
}
