//! Sending to WebSocket sessions.
//!
//! The `*_sync` functions wait until the writer task has flushed the frame
//! to the socket, the `*_async` ones only queue it. The `*_blocking`
//! variants are for broker delivery threads, which run outside the async
//! runtime.
//!
//! A binary payload goes out as a single frame. Its source reader is
//! dropped exactly once when the copy ends, and the frame is either queued
//! whole or discarded, also on copy errors. Dropping a send before its copy
//! has finished discards the frame too.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use super::session::{FlushHandle, WsSession};
use crate::codec::{BinaryData, Codec};
use crate::message::AnyMessage;
use crate::utils::error::GatewayError;

pub async fn send_text_sync(session: &WsSession, text: String) -> Result<(), GatewayError> {
    session
        .enqueue_flushed(WsMessage::Text(text.into()))?
        .flushed()
        .await
}

pub fn send_text_async(session: &WsSession, text: String) -> Result<(), GatewayError> {
    session.enqueue(WsMessage::Text(text.into()))
}

pub async fn send_message_sync(
    session: &WsSession,
    message: &dyn AnyMessage,
) -> Result<(), GatewayError> {
    send_text_sync(session, Codec::encode(message)?).await
}

pub fn send_message_async(session: &WsSession, message: &dyn AnyMessage) -> Result<(), GatewayError> {
    send_text_async(session, Codec::encode(message)?)
}

/// Sends `message` as text, or as a binary envelope when there is an
/// attachment to stream behind it.
pub async fn send_sync(
    session: &WsSession,
    message: &dyn AnyMessage,
    attachment: Option<BinaryData>,
) -> Result<(), GatewayError> {
    match attachment {
        None => send_message_sync(session, message).await,
        Some(data) => send_binary_sync(session, Codec::envelope_reader(message, data)?).await,
    }
}

/// Copies `reader` into one binary frame and waits for it to be flushed.
pub async fn send_binary_sync<R>(session: &WsSession, reader: R) -> Result<(), GatewayError>
where
    R: Read + Send + 'static,
{
    let sink = BinaryFrameSink::new(session.clone());
    let _cancel_on_drop = CancelOnDrop(sink.cancelled.clone());
    let flushed = tokio::task::spawn_blocking(move || copy_into(reader, sink))
        .await
        .map_err(|e| GatewayError::Io(io::Error::other(e)))??;
    flushed.flushed().await
}

/// Hands the copy to `handle` and returns at once. With a timeout, a send
/// that has not been flushed in time is abandoned and logged. If its copy
/// is still running at that point, the frame is never queued.
pub fn send_binary_async<R>(
    session: &WsSession,
    reader: R,
    handle: &Handle,
    timeout: Option<Duration>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    let session = session.clone();
    handle.spawn(async move {
        let send = send_binary_sync(&session, reader);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .unwrap_or(Err(GatewayError::Timeout(limit))),
            None => send.await,
        };
        if let Err(e) = result {
            warn!(session = %session.id(), error = %e, "asynchronous binary send failed");
        }
    })
}

/// [`send_sync`] for threads outside the runtime.
pub fn send_sync_blocking(
    session: &WsSession,
    message: &dyn AnyMessage,
    attachment: Option<BinaryData>,
) -> Result<(), GatewayError> {
    let flushed = match attachment {
        None => session.enqueue_flushed(WsMessage::Text(Codec::encode(message)?.into()))?,
        Some(data) => copy_into(
            Codec::envelope_reader(message, data)?,
            BinaryFrameSink::new(session.clone()),
        )?,
    };
    flushed.blocking_flushed()
}

fn copy_into<R: Read>(mut reader: R, mut sink: BinaryFrameSink) -> Result<FlushHandle, GatewayError> {
    let copied = io::copy(&mut reader, &mut sink);
    drop(reader);
    match copied {
        Ok(bytes) => {
            debug!(session = %sink.session.id(), bytes, "binary frame assembled");
            sink.finish()
        }
        Err(e) => {
            sink.abort();
            Err(e.into())
        }
    }
}

/// Marks the sink cancelled when the owning send is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Collects the bytes of one outgoing binary frame.
struct BinaryFrameSink {
    session: WsSession,
    buffer: Vec<u8>,
    cancelled: Arc<AtomicBool>,
}

impl BinaryFrameSink {
    fn new(session: WsSession) -> Self {
        Self {
            session,
            buffer: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn finish(self) -> Result<FlushHandle, GatewayError> {
        if self.is_cancelled() {
            let session = self.session.id().to_string();
            self.abort();
            return Err(GatewayError::SendCancelled(session));
        }
        self.session
            .enqueue_flushed(WsMessage::Binary(self.buffer.into()))
    }

    fn abort(self) {
        debug!(
            session = %self.session.id(),
            discarded = self.buffer.len(),
            "binary frame discarded"
        );
    }
}

impl Write for BinaryFrameSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_cancelled() {
            return Err(io::Error::other("binary send cancelled"));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
