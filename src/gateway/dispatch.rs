use std::io::{Cursor, Read};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use super::commands::{AttachmentSlot, WsCommandContextFactory, WsCommands};
use super::outbound;
use super::session::WsSession;
use crate::codec::Codec;
use crate::message::{AnyMessage, GenericErrorResponse};
use crate::utils::error::{GatewayError, ProtocolViolation};

/// Turns inbound frames into command executions.
pub struct CommandDispatcher {
    codec: Arc<Codec>,
    commands: Arc<WsCommands>,
    contexts: WsCommandContextFactory,
}

impl CommandDispatcher {
    pub fn new(
        codec: Arc<Codec>,
        commands: Arc<WsCommands>,
        contexts: WsCommandContextFactory,
    ) -> Self {
        Self {
            codec,
            commands,
            contexts,
        }
    }

    pub fn commands(&self) -> &WsCommands {
        &self.commands
    }

    pub fn contexts(&self) -> &WsCommandContextFactory {
        &self.contexts
    }

    pub async fn on_text(&self, session: &WsSession, text: &str) {
        let result = match self.codec.decode(text) {
            Ok(request) => self.handle_request(session, request, AttachmentSlot::empty()).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            let type_name = envelope_type(text.as_bytes());
            self.report(session, format!("Failed to process message [{type_name}]"), &e)
                .await;
        }
    }

    pub async fn on_binary(&self, session: &WsSession, bytes: Vec<u8>) {
        let type_name = envelope_type(&bytes);
        let reader: Box<dyn Read + Send> = Box::new(Cursor::new(bytes));
        let result = match self.codec.decode_stream(reader) {
            Ok((request, attachment)) => {
                self.handle_request(session, request, AttachmentSlot::new(Some(attachment)))
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.report(session, format!("Command failed [{type_name}]"), &e)
                .await;
        }
    }

    async fn handle_request(
        &self,
        session: &WsSession,
        mut request: Box<dyn AnyMessage>,
        attachment: AttachmentSlot,
    ) -> Result<(), GatewayError> {
        stamp_session_origin(session, request.as_mut());
        let commands = self.commands.commands_for(request.as_ref())?;
        let context = self.contexts.new_context(session);
        for command in commands {
            debug!(
                session = %session.id(),
                command = command.name(),
                request = request.type_name(),
                "executing command"
            );
            let execution = command.execute_dyn(request.as_ref(), &attachment, &context);
            match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(GatewayError::Command(format!(
                        "command {} panicked",
                        command.name()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn report(&self, session: &WsSession, message: String, error: &GatewayError) {
        warn!(session = %session.id(), error = %error, "{message}");
        let response = GenericErrorResponse::from_error(message, error);
        if let Err(e) = outbound::send_message_sync(session, &response).await {
            error!(
                session = %session.id(),
                error = %e,
                "could not send error response"
            );
        }
    }
}

/// Replaces whatever session origin the client put in the message with the
/// id of the session it actually arrived on.
fn stamp_session_origin(session: &WsSession, request: &mut dyn AnyMessage) {
    let type_name = request.type_name();
    let Some(origin) = request.session_origin_mut() else {
        return;
    };
    if let Some(claimed) = origin.as_deref() {
        if claimed != session.id() {
            let violation = ProtocolViolation::SpoofedSessionOrigin {
                claimed: claimed.to_string(),
                actual: session.id().to_string(),
            };
            warn!(request = type_name, error = %violation, "overwriting session origin");
        }
    }
    *origin = Some(session.id().to_string());
}

/// The type name of an envelope, for error messages.
fn envelope_type(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&b| b == b'=')
        .unwrap_or(bytes.len())
        .min(64);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
