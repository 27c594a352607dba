//! Request/response over the bus.
//!
//! The client side sends a request whose reply-to is a fresh temporary
//! queue and either waits for the single response arriving there
//! ([`MessageProcessor::send_rpc`]) or hands every response to a listener
//! until the caller closes the queue ([`MessageProcessor::send_and_listen`]).
//! The server side
//! runs a handler per request and sends its answer to the reply-to of the
//! request, correlated with the request id.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::MessageProcessor;
use super::listener::{Delivery, ListenerAdapter, MessageListener, decode_delivery};
use crate::broker::{DeliveryListener, Destination, TransportMessage};
use crate::codec::Codec;
use crate::context::{ConsumerContext, ProducerContext, SessionHandle};
use crate::message::{
    AnyMessage, BasicMessage, FromDecoded, GenericErrorResponse, Message, MessageBody, MessageId,
};
use crate::utils::error::{BusError, DecodeError, ProtocolViolation};

const WAITING: u8 = 0;
const DELIVERING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

type ResponseSender<R> = oneshot::Sender<Result<Delivery<R>, BusError>>;

/// State of one outstanding request: its response consumer and how far the
/// round trip has come.
struct RpcContext {
    consumer: ConsumerContext,
    request_id: Mutex<Option<MessageId>>,
    state: AtomicU8,
}

impl RpcContext {
    fn new(consumer: ConsumerContext) -> Self {
        Self {
            consumer,
            request_id: Mutex::new(None),
            state: AtomicU8::new(WAITING),
        }
    }

    fn set_request_id(&self, id: MessageId) {
        *self.request_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    /// A response is only rejected when both ids are known and differ.
    fn is_correlated(&self, correlation_id: Option<&MessageId>) -> bool {
        let request_id = self.request_id.lock().unwrap_or_else(PoisonError::into_inner);
        match (request_id.as_ref(), correlation_id) {
            (Some(request), Some(correlation)) => request == correlation,
            _ => true,
        }
    }

    fn begin_delivery(&self) -> bool {
        self.state
            .compare_exchange(WAITING, DELIVERING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn abandon_delivery(&self) {
        let _ = self
            .state
            .compare_exchange(DELIVERING, WAITING, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.state.store(DONE, Ordering::SeqCst);
        self.consumer.close();
    }

    fn cancel(&self) {
        match self
            .state
            .compare_exchange(WAITING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                debug!(reply_to = %self.consumer.destination(), "RPC cancelled");
                self.consumer.close();
            }
            Err(DELIVERING) => warn!(
                reply_to = %self.consumer.destination(),
                "cancel requested while the response is being delivered; ignoring"
            ),
            Err(_) => {}
        }
    }
}

/// Receives the response on the temporary queue and completes the future.
struct ResponseListener<R> {
    codec: Arc<Codec>,
    context: Arc<RpcContext>,
    sender: Mutex<Option<ResponseSender<R>>>,
}

impl<R> ResponseListener<R> {
    fn complete(&self, result: Result<Delivery<R>, BusError>) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
        self.context.finish();
    }

    fn future_dropped(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|sender| sender.is_closed())
    }
}

impl<R: FromDecoded> DeliveryListener for ResponseListener<R> {
    fn on_delivery(&self, message: TransportMessage) {
        if !self.context.begin_delivery() {
            debug!("response arrived after the RPC was cancelled or completed");
            return;
        }

        if !self.context.is_correlated(message.correlation_id.as_ref()) {
            warn!(
                correlation_id = ?message.correlation_id,
                "ignoring response that belongs to another request"
            );
            self.context.abandon_delivery();
            if self.future_dropped() {
                self.context.cancel();
            }
            return;
        }

        let result = decode_delivery::<Box<dyn AnyMessage>>(&self.codec, message)
            .map_err(BusError::from)
            .and_then(|delivery| into_response::<R>(delivery));
        self.complete(result);
    }
}

/// Converts a decoded response, turning an error response the other side
/// sent in place of the expected type into a [`BusError::Remote`].
fn into_response<R: FromDecoded>(
    delivery: Delivery<Box<dyn AnyMessage>>,
) -> Result<Delivery<R>, BusError> {
    let Delivery {
        message: Message { body, meta },
        attachment,
    } = delivery;
    match R::from_decoded(body) {
        Ok(body) => Ok(Delivery {
            message: Message { body, meta },
            attachment,
        }),
        Err(other) => {
            if let Some(remote) = other.as_any().downcast_ref::<GenericErrorResponse>() {
                return Err(BusError::Remote(
                    remote.error_message.clone().unwrap_or_default(),
                ));
            }
            Err(DecodeError::UnexpectedType {
                expected: R::expected_type(),
                actual: other.type_name(),
            }
            .into())
        }
    }
}

/// Cancels the request when the future goes away unresolved.
struct CancelGuard(Arc<RpcContext>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

enum FutureState<R> {
    Failed(Option<BusError>),
    Pending {
        receiver: oneshot::Receiver<Result<Delivery<R>, BusError>>,
        _guard: CancelGuard,
    },
}

/// The eventual response to [`MessageProcessor::send_rpc`].
///
/// Dropping the future cancels the request. It never resolves on its own
/// if no response arrives; use [`RpcFuture::with_timeout`] to bound the wait.
pub struct RpcFuture<R> {
    state: FutureState<R>,
}

impl<R> Unpin for RpcFuture<R> {}

impl<R> RpcFuture<R> {
    fn failed(error: BusError) -> Self {
        Self {
            state: FutureState::Failed(Some(error)),
        }
    }

    /// Waits at most `timeout`, then cancels the request.
    pub async fn with_timeout(self, timeout: Duration) -> Result<Delivery<R>, BusError> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl<R> Future for RpcFuture<R> {
    type Output = Result<Delivery<R>, BusError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(BusError::Cancelled)))
            }
            FutureState::Pending { receiver, .. } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(BusError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// The response side of [`MessageProcessor::send_and_listen`]: the
/// temporary queue responses arrive on and the consumer feeding the
/// listener. Closing or dropping it deletes the queue.
#[derive(Debug)]
pub struct RpcConsumerHandle {
    consumer: ConsumerContext,
    request_id: MessageId,
}

impl RpcConsumerHandle {
    /// The id the broker gave the request; responses carry it as their
    /// correlation id.
    pub fn request_id(&self) -> &MessageId {
        &self.request_id
    }

    pub fn reply_to(&self) -> &Destination {
        self.consumer.destination()
    }

    pub fn is_closed(&self) -> bool {
        self.consumer.is_closed()
    }

    pub fn close(&self) {
        self.consumer.close();
    }
}

/// Answers requests arriving on a consumer context.
pub trait RpcHandler: Send + Sync + 'static {
    type Request: FromDecoded;
    type Response: BasicMessage;

    /// `None` means there is nothing to send back.
    fn on_request(&self, request: Delivery<Self::Request>) -> Option<Self::Response>;
}

pub(crate) struct RpcListenerAdapter<H> {
    pub processor: MessageProcessor,
    pub handle: SessionHandle,
    pub destination: Destination,
    pub handler: H,
}

impl<H: RpcHandler> RpcListenerAdapter<H> {
    fn reply<B: MessageBody>(&self, reply_to: Destination, request_id: Option<MessageId>, body: B) {
        let producer = match ProducerContext::derived(self.handle.clone(), reply_to) {
            Ok(producer) => producer,
            Err(e) => {
                error!(error = %e, "cannot create producer for RPC response");
                return;
            }
        };
        let mut response = Message::new(body);
        response.meta.correlation_id = request_id;
        let result = self.processor.send(&producer, &response, None);
        producer.close();
        match result {
            Ok(id) => debug!(
                reply_to = %producer.destination(),
                message_id = %id,
                "sent RPC response"
            ),
            Err(e) => error!(
                reply_to = %producer.destination(),
                error = %e,
                "failed to send RPC response"
            ),
        }
    }
}

impl<H: RpcHandler> DeliveryListener for RpcListenerAdapter<H> {
    fn on_delivery(&self, message: TransportMessage) {
        let reply_to = message.reply_to.clone();
        let request_id = message.message_id.clone();

        let outcome = match decode_delivery::<H::Request>(&self.processor.codec, message) {
            Ok(request) => {
                match catch_unwind(AssertUnwindSafe(|| self.handler.on_request(request))) {
                    Ok(response) => Ok(response),
                    Err(_) => {
                        error!(destination = %self.destination, "RPC handler panicked");
                        Err(GenericErrorResponse {
                            error_message: Some("Request handler failed".to_string()),
                            stack_trace: None,
                        })
                    }
                }
            }
            Err(e) => {
                warn!(destination = %self.destination, error = %e, "cannot decode RPC request");
                Err(GenericErrorResponse::from_error("Failed to decode request", &e))
            }
        };

        let Some(reply_to) = reply_to else {
            debug!(
                destination = %self.destination,
                reason = %ProtocolViolation::MissingReplyTo,
                "not sending a response"
            );
            return;
        };
        match outcome {
            Ok(Some(response)) => self.reply(reply_to, request_id, response),
            Ok(None) => debug!(destination = %self.destination, "handler produced no response"),
            Err(error_response) => self.reply(reply_to, request_id, error_response),
        }
    }
}

impl MessageProcessor {
    /// Sends `request` and returns a future for its response.
    ///
    /// Never fails up front: a failure to set up the response queue or to
    /// send yields a future that is already failed.
    pub fn send_rpc<R: FromDecoded, M: MessageBody>(
        &self,
        context: &ProducerContext,
        request: &Message<M>,
        headers: Option<&std::collections::HashMap<String, String>>,
    ) -> RpcFuture<R> {
        match self.try_send_rpc(context, request, headers) {
            Ok(future) => future,
            Err(e) => {
                warn!(destination = %context.destination(), error = %e, "RPC request not sent");
                RpcFuture::failed(e)
            }
        }
    }

    fn try_send_rpc<R: FromDecoded, M: MessageBody>(
        &self,
        context: &ProducerContext,
        request: &Message<M>,
        headers: Option<&std::collections::HashMap<String, String>>,
    ) -> Result<RpcFuture<R>, BusError> {
        let transport = self.transport_message(request, headers)?;
        let rpc = Arc::new(RpcContext::new(reply_consumer(context)?));

        let (sender, receiver) = oneshot::channel();
        let listener = ResponseListener {
            codec: self.codec.clone(),
            context: rpc.clone(),
            sender: Mutex::new(Some(sender)),
        };
        if let Err(e) = rpc.consumer.consumer().set_listener(Arc::new(listener)) {
            rpc.consumer.close();
            return Err(e.into());
        }
        let id = send_request(context, transport, &rpc.consumer)?;
        rpc.set_request_id(id);

        Ok(RpcFuture {
            state: FutureState::Pending {
                receiver,
                _guard: CancelGuard(rpc),
            },
        })
    }

    /// Sends `request` and hands every response arriving on its temporary
    /// reply queue to `listener`.
    ///
    /// Any number of responses may come back. The queue stays until the
    /// returned handle is closed or dropped.
    pub fn send_and_listen<L: MessageListener, M: MessageBody>(
        &self,
        context: &ProducerContext,
        request: &Message<M>,
        listener: L,
        headers: Option<&std::collections::HashMap<String, String>>,
    ) -> Result<RpcConsumerHandle, BusError> {
        let transport = self.transport_message(request, headers)?;
        let consumer = reply_consumer(context)?;
        let adapter = ListenerAdapter {
            codec: self.codec.clone(),
            destination: consumer.destination().clone(),
            listener,
        };
        if let Err(e) = consumer.consumer().set_listener(Arc::new(adapter)) {
            consumer.close();
            return Err(e.into());
        }
        let request_id = send_request(context, transport, &consumer)?;
        Ok(RpcConsumerHandle {
            consumer,
            request_id,
        })
    }

    /// Serves requests arriving on `context` with `handler`.
    pub fn listen_rpc<H: RpcHandler>(
        &self,
        context: &ConsumerContext,
        handler: H,
    ) -> Result<(), BusError> {
        let adapter = RpcListenerAdapter {
            processor: self.clone(),
            handle: context.handle().clone(),
            destination: context.destination().clone(),
            handler,
        };
        context.consumer().set_listener(Arc::new(adapter))?;
        Ok(())
    }
}

/// A consumer on a fresh temporary queue, sharing the producer's session.
fn reply_consumer(context: &ProducerContext) -> Result<ConsumerContext, BusError> {
    let handle = context.handle().clone();
    let reply_to = handle
        .session
        .create_destination(&crate::broker::Endpoint::temporary_queue())?;
    Ok(ConsumerContext::derived(handle, reply_to, None)?)
}

/// Sends the request with `reply` as its reply-to. The reply consumer is
/// closed if the send fails.
fn send_request(
    context: &ProducerContext,
    mut transport: TransportMessage,
    reply: &ConsumerContext,
) -> Result<MessageId, BusError> {
    transport.reply_to = Some(reply.destination().clone());
    match context.producer().send(transport) {
        Ok(id) => {
            debug!(
                destination = %context.destination(),
                reply_to = %reply.destination(),
                request_id = %id,
                "sent RPC request"
            );
            Ok(id)
        }
        Err(e) => {
            reply.close();
            Err(e.into())
        }
    }
}
