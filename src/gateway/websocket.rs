use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use super::session::{OutboundFrame, WsSession};
use super::{Gateway, Route};
use crate::utils::error::GatewayError;

/// Binds `addr` and serves the gateway on it until the task is dropped.
pub async fn start_websocket_server(addr: &str, gateway: Arc<Gateway>) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket gateway listening on ws://{}", listener.local_addr()?);
    serve(listener, gateway).await;
    Ok(())
}

/// Accepts connections on an already bound listener.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let gateway = gateway.clone();
                tokio::spawn(handle_connection(stream, peer, gateway));
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>) {
    let mut route = None;
    let mut path = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        match gateway.route(&path) {
            Some(found) => {
                route = Some(found);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some(format!("no endpoint at {path}")));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };
    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let Some(route) = route else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let session = WsSession::new(path, tx);

    let session_id = session.id().to_string();
    let writer = tokio::spawn(async move {
        while let Some(OutboundFrame { message, flushed }) = rx.recv().await {
            let closing = message.is_close();
            let result = ws_sender.send(message).await;
            if let Some(ack) = flushed {
                let _ = ack.send(result.is_ok());
            }
            if let Err(e) = result {
                debug!(session = %session_id, error = %e, "send loop stopped");
                break;
            }
            if closing {
                break;
            }
        }
        debug!(session = %session_id, "send loop closed");
    });

    let registered = match &route {
        Route::Feed(feed_id) => gateway.open_feed(feed_id, &session),
        Route::Ui => match gateway.open_ui(&session) {
            Ok(added) => added,
            Err(e) => {
                warn!(session = %session.id(), error = %e, "cannot greet UI session");
                false
            }
        },
    };
    if !registered {
        session.close(CloseCode::Policy, "session not registered");
        let _ = writer.await;
        return;
    }
    info!(session = %session.id(), %peer, endpoint = session.endpoint(), "WebSocket session open");

    let mut close_frame = None;
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                gateway.dispatcher().on_text(&session, text.as_str()).await;
            }
            Ok(WsMessage::Binary(bytes)) => {
                gateway.dispatcher().on_binary(&session, bytes.to_vec()).await;
            }
            Ok(WsMessage::Close(frame)) => {
                close_frame = frame;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session.id(), error = %e, "read loop stopped");
                break;
            }
        }
    }

    match &route {
        Route::Feed(feed_id) => {
            let code = close_frame.as_ref().map(|frame| u16::from(frame.code));
            let reason = close_frame
                .as_ref()
                .map(|frame| frame.reason.as_str().to_string())
                .filter(|reason| !reason.is_empty());
            gateway.close_feed(feed_id, &session, code, reason);
        }
        Route::Ui => gateway.close_ui(&session),
    }
    session.close(CloseCode::Normal, "");
    let _ = writer.await;
    info!(session = %session.id(), "WebSocket session closed");
}
