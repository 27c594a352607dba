use std::any::TypeId;
use std::collections::HashMap;
use std::io::Read;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use super::outbound;
use super::session::WsSession;
use super::sessions::WsEndpoints;
use super::{HEADER_FEED_ID, HEADER_UI_CLIENT_ID, feed_command_queue, ui_command_queue};
use crate::broker::{ConnectionFactory, Endpoint};
use crate::codec::BinaryData;
use crate::context::ConnectionContextFactory;
use crate::message::{
    AnyMessage, BasicMessage, EchoRequest, EchoResponse, ExecuteOperationRequest,
    ExecuteOperationResponse, Message,
};
use crate::processor::MessageProcessor;
use crate::utils::error::GatewayError;

/// The binary attachment of a request. The first command to take it owns
/// it; the rest see it is present but cannot read it.
pub struct AttachmentSlot {
    data: Mutex<Option<BinaryData>>,
    present: bool,
}

impl AttachmentSlot {
    pub fn new(data: Option<BinaryData>) -> Self {
        Self {
            present: data.is_some(),
            data: Mutex::new(data),
        }
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    /// Whether the request came with an attachment, taken or not.
    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn take(&self) -> Option<BinaryData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Everything a command may need while handling one request.
#[derive(Clone)]
pub struct WsCommandContext {
    session: WsSession,
    connection_factory: Arc<dyn ConnectionFactory>,
    contexts: Arc<ConnectionContextFactory>,
    endpoints: Arc<WsEndpoints>,
    processor: MessageProcessor,
    send_timeout: Option<Duration>,
}

impl WsCommandContext {
    /// The session the request came from.
    pub fn session(&self) -> &WsSession {
        &self.session
    }

    pub fn connection_factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.connection_factory
    }

    pub fn endpoints(&self) -> &WsEndpoints {
        &self.endpoints
    }

    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    /// Shared by every request of the gateway.
    pub fn context_factory(&self) -> &ConnectionContextFactory {
        &self.contexts
    }

    /// Streams `reader` to the session in the background, bounded by the
    /// configured send timeout.
    pub fn send_binary_async<R: Read + Send + 'static>(&self, reader: R) -> JoinHandle<()> {
        outbound::send_binary_async(&self.session, reader, &Handle::current(), self.send_timeout)
    }
}

/// Builds a fresh [`WsCommandContext`] per request.
#[derive(Clone)]
pub struct WsCommandContextFactory {
    connection_factory: Arc<dyn ConnectionFactory>,
    contexts: Arc<ConnectionContextFactory>,
    endpoints: Arc<WsEndpoints>,
    processor: MessageProcessor,
    send_timeout: Option<Duration>,
}

impl WsCommandContextFactory {
    pub fn new(
        connection_factory: Arc<dyn ConnectionFactory>,
        contexts: Arc<ConnectionContextFactory>,
        endpoints: Arc<WsEndpoints>,
        processor: MessageProcessor,
    ) -> Self {
        Self {
            connection_factory,
            contexts,
            endpoints,
            processor,
            send_timeout: None,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn new_context(&self, session: &WsSession) -> WsCommandContext {
        WsCommandContext {
            session: session.clone(),
            connection_factory: self.connection_factory.clone(),
            contexts: self.contexts.clone(),
            endpoints: self.endpoints.clone(),
            processor: self.processor.clone(),
            send_timeout: self.send_timeout,
        }
    }

    pub fn context_factory(&self) -> &Arc<ConnectionContextFactory> {
        &self.contexts
    }
}

/// Handles one request type arriving over a WebSocket.
#[async_trait]
pub trait WsCommand: Send + Sync + 'static {
    type Request: BasicMessage;

    async fn execute(
        &self,
        request: &Self::Request,
        attachment: &AttachmentSlot,
        context: &WsCommandContext,
    ) -> Result<(), GatewayError>;
}

#[async_trait]
pub(crate) trait DynWsCommand: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute_dyn(
        &self,
        request: &dyn AnyMessage,
        attachment: &AttachmentSlot,
        context: &WsCommandContext,
    ) -> Result<(), GatewayError>;
}

struct Typed<C>(C);

#[async_trait]
impl<C: WsCommand> DynWsCommand for Typed<C> {
    fn name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    async fn execute_dyn(
        &self,
        request: &dyn AnyMessage,
        attachment: &AttachmentSlot,
        context: &WsCommandContext,
    ) -> Result<(), GatewayError> {
        let Some(request) = request.as_any().downcast_ref::<C::Request>() else {
            return Err(GatewayError::Command(format!(
                "{} cannot handle [{}]",
                self.name(),
                request.type_name()
            )));
        };
        self.0.execute(request, attachment, context).await
    }
}

/// Commands by request type, in registration order.
#[derive(Default)]
pub struct WsCommands {
    commands: Vec<(TypeId, Arc<dyn DynWsCommand>)>,
}

impl WsCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo plus forwarding of operation requests to feeds and operation
    /// responses to UI sessions.
    pub fn with_defaults() -> Self {
        let mut commands = Self::new();
        commands
            .register(EchoCommand)
            .register(FeedDestinationCommand::<ExecuteOperationRequest>::new())
            .register(UiSessionDestinationCommand::<ExecuteOperationResponse>::new());
        commands
    }

    pub fn register<C: WsCommand>(&mut self, command: C) -> &mut Self {
        self.commands
            .push((TypeId::of::<C::Request>(), Arc::new(Typed(command))));
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Every command registered for the message's concrete type.
    pub(crate) fn commands_for(
        &self,
        message: &dyn AnyMessage,
    ) -> Result<Vec<Arc<dyn DynWsCommand>>, GatewayError> {
        let type_id = message.as_any().type_id();
        let matching: Vec<_> = self
            .commands
            .iter()
            .filter(|(id, _)| *id == type_id)
            .map(|(_, command)| command.clone())
            .collect();
        if matching.is_empty() {
            return Err(GatewayError::NoCommand(message.type_name().to_string()));
        }
        Ok(matching)
    }
}

/// Replies `ECHO [<message>]`, streaming any attachment straight back.
pub struct EchoCommand;

#[async_trait]
impl WsCommand for EchoCommand {
    type Request = EchoRequest;

    async fn execute(
        &self,
        request: &EchoRequest,
        attachment: &AttachmentSlot,
        context: &WsCommandContext,
    ) -> Result<(), GatewayError> {
        let response = EchoResponse {
            reply: format!("ECHO [{}]", request.echo_message),
        };
        outbound::send_sync(context.session(), &response, attachment.take()).await
    }
}

/// Forwards a request to the feed it names, through the feed command queue.
pub struct FeedDestinationCommand<T>(PhantomData<fn() -> T>);

impl<T> FeedDestinationCommand<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for FeedDestinationCommand<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: BasicMessage + Clone> WsCommand for FeedDestinationCommand<T> {
    type Request = T;

    async fn execute(
        &self,
        request: &T,
        attachment: &AttachmentSlot,
        context: &WsCommandContext,
    ) -> Result<(), GatewayError> {
        let feed_id = request.destination_feed_id().ok_or_else(|| {
            GatewayError::Command(format!("[{}] does not name a feed", T::TYPE_NAME))
        })?;
        forward(
            context,
            &feed_command_queue(),
            HEADER_FEED_ID,
            feed_id,
            request,
            attachment,
        )
    }
}

/// Forwards a message to the UI session it names, through the UI command
/// queue.
pub struct UiSessionDestinationCommand<T>(PhantomData<fn() -> T>);

impl<T> UiSessionDestinationCommand<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for UiSessionDestinationCommand<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: BasicMessage + Clone> WsCommand for UiSessionDestinationCommand<T> {
    type Request = T;

    async fn execute(
        &self,
        request: &T,
        attachment: &AttachmentSlot,
        context: &WsCommandContext,
    ) -> Result<(), GatewayError> {
        let ui_client_id = request.destination_session_id().ok_or_else(|| {
            GatewayError::Command(format!("[{}] does not name a UI session", T::TYPE_NAME))
        })?;
        forward(
            context,
            &ui_command_queue(),
            HEADER_UI_CLIENT_ID,
            ui_client_id,
            request,
            attachment,
        )
    }
}

fn forward<T: BasicMessage + Clone>(
    context: &WsCommandContext,
    endpoint: &Endpoint,
    header: &str,
    key: &str,
    request: &T,
    attachment: &AttachmentSlot,
) -> Result<(), GatewayError> {
    let producer = context.context_factory().create_producer_context(endpoint)?;
    let headers: HashMap<String, String> = [(header.to_string(), key.to_string())].into();
    let message = Message::new(request.clone());
    let id = match attachment.take() {
        Some(data) => context
            .processor()
            .send_with_attachment(&producer, &message, data, Some(&headers))?,
        None => context.processor().send(&producer, &message, Some(&headers))?,
    };
    debug!(
        destination = %producer.destination(),
        header,
        key,
        message_id = %id,
        "forwarded {}",
        T::TYPE_NAME
    );
    Ok(())
}
