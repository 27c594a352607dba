//! The `gateway` module bridges WebSocket clients and the bus.
//!
//! Two kinds of clients connect: feeds, on `<feed_path>/<feedId>`, and UI
//! clients, on `<ui_path>`. Every text or binary frame they send is decoded
//! and handed to the [`WsCommand`]s registered for its type. Messages put on
//! the feed or UI command queue with the matching header are pushed back
//! down the right socket (see [`bridge`]).

pub mod bridge;
pub mod commands;
pub mod dispatch;
pub mod outbound;
pub mod session;
pub mod sessions;
pub mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{ConnectionFactory, Endpoint};
use crate::codec::Codec;
use crate::config::{BusSettings, GatewaySettings};
use crate::context::ConnectionContextFactory;
use crate::message::{FeedWebSocketClosedEvent, Message, WelcomeResponse};
use crate::processor::MessageProcessor;
use crate::utils::error::GatewayError;

pub use bridge::BusEndpointProcessors;
pub use commands::{
    AttachmentSlot, EchoCommand, FeedDestinationCommand, UiSessionDestinationCommand, WsCommand,
    WsCommandContext, WsCommandContextFactory, WsCommands,
};
pub use dispatch::CommandDispatcher;
pub use session::{OutboundFrame, WsSession};
pub use sessions::{SessionRegistry, WsEndpoints, WsSessionListener};
pub use websocket::{serve, start_websocket_server};

/// Header naming the feed a queued command is for.
pub const HEADER_FEED_ID: &str = "feedId";

/// Header naming the UI session a queued message is for.
pub const HEADER_UI_CLIENT_ID: &str = "uiClientId";

pub fn feed_command_queue() -> Endpoint {
    Endpoint::queue("FeedCommandQueue")
}

pub fn ui_command_queue() -> Endpoint {
    Endpoint::queue("UiCommandQueue")
}

/// Topic carrying gateway lifecycle events.
pub fn events_topic() -> Endpoint {
    Endpoint::topic("CommandEvents")
}

/// Which endpoint a request path addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Feed(String),
    Ui,
}

pub struct Gateway {
    endpoints: Arc<WsEndpoints>,
    dispatcher: CommandDispatcher,
    contexts: Arc<ConnectionContextFactory>,
    processor: MessageProcessor,
    feed_path: String,
    ui_path: String,
}

impl Gateway {
    pub fn new(
        connection_factory: Arc<dyn ConnectionFactory>,
        codec: Arc<Codec>,
        commands: WsCommands,
        gateway: &GatewaySettings,
        bus: &BusSettings,
    ) -> Self {
        let endpoints = Arc::new(WsEndpoints::new(&gateway.feed_path, &gateway.ui_path));
        let contexts = Arc::new(
            ConnectionContextFactory::new(connection_factory.clone())
                .with_reuse_connection(bus.reuse_connection),
        );
        let processor = MessageProcessor::new(codec.clone());
        BusEndpointProcessors::attach(&endpoints, contexts.clone(), processor.clone());

        let command_contexts = WsCommandContextFactory::new(
            connection_factory,
            contexts.clone(),
            endpoints.clone(),
            processor.clone(),
        )
        .with_send_timeout(gateway.async_send_timeout());

        Self {
            dispatcher: CommandDispatcher::new(codec, Arc::new(commands), command_contexts),
            endpoints,
            contexts,
            processor,
            feed_path: gateway.feed_path.trim_end_matches('/').to_string(),
            ui_path: gateway.ui_path.clone(),
        }
    }

    pub fn endpoints(&self) -> &WsEndpoints {
        &self.endpoints
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Maps a request path onto an endpoint; `None` for unknown paths.
    pub fn route(&self, path: &str) -> Option<Route> {
        if path == self.ui_path {
            return Some(Route::Ui);
        }
        let feed_id = path.strip_prefix(&self.feed_path)?.strip_prefix('/')?;
        if feed_id.is_empty() || feed_id.contains('/') {
            return None;
        }
        Some(Route::Feed(feed_id.to_string()))
    }

    /// Registers a feed session. `false` means the feed id was taken and
    /// the session has been closed.
    pub fn open_feed(&self, feed_id: &str, session: &WsSession) -> bool {
        self.endpoints.feeds().add(feed_id, session.clone())
    }

    /// Greets a UI session with its id, then registers it under that id.
    pub fn open_ui(&self, session: &WsSession) -> Result<bool, GatewayError> {
        let welcome = WelcomeResponse {
            session_id: session.id().to_string(),
        };
        outbound::send_message_async(session, &welcome)?;
        Ok(self.endpoints.ui_clients().add(session.id(), session.clone()))
    }

    /// Deregisters a feed session and tells the bus the feed went away.
    pub fn close_feed(
        &self,
        feed_id: &str,
        session: &WsSession,
        code: Option<u16>,
        reason: Option<String>,
    ) {
        if !self.endpoints.feeds().remove(feed_id, Some(session)) {
            return;
        }
        let event = FeedWebSocketClosedEvent {
            feed_id: feed_id.to_string(),
            reason,
            code,
        };
        if let Err(e) = self.publish_event(feed_id, event) {
            warn!(feed_id, error = %e, "cannot publish feed closed event");
        }
    }

    pub fn close_ui(&self, session: &WsSession) {
        self.endpoints.ui_clients().remove(session.id(), Some(session));
    }

    /// Drops every session and the shared broker connection.
    pub fn shutdown(&self) {
        self.endpoints.destroy();
        self.contexts.close();
        info!("gateway shut down");
    }

    fn publish_event(
        &self,
        feed_id: &str,
        event: FeedWebSocketClosedEvent,
    ) -> Result<(), GatewayError> {
        let producer = self.contexts.create_producer_context(&events_topic())?;
        let headers = HashMap::from([(HEADER_FEED_ID.to_string(), feed_id.to_string())]);
        let id = self
            .processor
            .send(&producer, &Message::new(event), Some(&headers))?;
        debug!(feed_id, message_id = %id, "published feed closed event");
        Ok(())
    }
}
