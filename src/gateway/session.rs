use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::utils::error::GatewayError;

/// A frame queued for the connection's writer task.
///
/// When `flushed` is set the writer reports whether the frame reached the
/// socket.
#[derive(Debug)]
pub struct OutboundFrame {
    pub message: WsMessage,
    pub flushed: Option<oneshot::Sender<bool>>,
}

/// One open WebSocket connection.
///
/// Cloning is cheap; every clone talks to the same writer task.
#[derive(Debug, Clone)]
pub struct WsSession {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    endpoint: String,
    sender: UnboundedSender<OutboundFrame>,
    open: AtomicBool,
}

impl WsSession {
    /// Creates a session with a fresh server-issued id.
    pub fn new(endpoint: impl Into<String>, sender: UnboundedSender<OutboundFrame>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: uuid::Uuid::new_v4().to_string(),
                endpoint: endpoint.into(),
                sender,
                open: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Request path the session was opened on.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst) && !self.inner.sender.is_closed()
    }

    /// Queues a frame without waiting for it to be written.
    pub fn enqueue(&self, message: WsMessage) -> Result<(), GatewayError> {
        self.push(OutboundFrame {
            message,
            flushed: None,
        })
    }

    /// Queues a frame; the handle resolves once the writer has flushed it.
    pub fn enqueue_flushed(&self, message: WsMessage) -> Result<FlushHandle, GatewayError> {
        let (tx, rx) = oneshot::channel();
        self.push(OutboundFrame {
            message,
            flushed: Some(tx),
        })?;
        Ok(FlushHandle {
            session_id: self.inner.id.clone(),
            receiver: rx,
        })
    }

    /// Sends a close frame. Later sends fail with `SessionClosed`.
    pub fn close(&self, code: CloseCode, reason: &str) {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.inner.sender.send(OutboundFrame {
            message: WsMessage::Close(Some(frame)),
            flushed: None,
        });
    }

    fn push(&self, frame: OutboundFrame) -> Result<(), GatewayError> {
        if !self.inner.open.load(Ordering::SeqCst) {
            return Err(GatewayError::SessionClosed(self.inner.id.clone()));
        }
        self.inner
            .sender
            .send(frame)
            .map_err(|_| GatewayError::SessionClosed(self.inner.id.clone()))
    }
}

impl PartialEq for WsSession {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for WsSession {}

/// Completion of a flushed send.
#[derive(Debug)]
pub struct FlushHandle {
    session_id: String,
    receiver: oneshot::Receiver<bool>,
}

impl FlushHandle {
    pub async fn flushed(self) -> Result<(), GatewayError> {
        match self.receiver.await {
            Ok(true) => Ok(()),
            _ => Err(GatewayError::SessionClosed(self.session_id)),
        }
    }

    /// Blocking wait, for threads outside the async runtime.
    pub fn blocking_flushed(self) -> Result<(), GatewayError> {
        match self.receiver.blocking_recv() {
            Ok(true) => Ok(()),
            _ => Err(GatewayError::SessionClosed(self.session_id)),
        }
    }
}
