//! The `error` module defines the error types used across `cmdbus`.
//!
//! Errors are grouped the way failures are handled: decode and encode errors
//! are scoped to one envelope, transport errors to one broker operation,
//! protocol violations to one peer, and cleanup errors are only ever logged.
//! `BusError` and `GatewayError` are the umbrella types returned by the
//! message processor and by the WebSocket gateway respectively.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A malformed envelope, an unresolvable type name, or a JSON/schema mismatch.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot decode [{0}], no '=' separator found")]
    MissingSeparator(String),

    #[error("type name is longer than {0} bytes")]
    TypeNameTooLong(usize),

    #[error("stream ended before the type name separator")]
    UnexpectedEof,

    #[error("type name is not valid UTF-8")]
    InvalidTypeName,

    #[error("unknown message type [{0}]")]
    UnknownType(String),

    #[error("JSON cannot be decoded as [{type_name}]: {source}")]
    InvalidJson {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected a [{expected}] message but received [{actual}]")]
    UnexpectedType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("read error while decoding: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("message [{type_name}] cannot be serialized: {source}")]
    Json {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("attachment cannot be read: {0}")]
    Attachment(#[from] io::Error),
}

/// Connection, session, and publish failures reported by a broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("invalid message selector [{selector}]: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid endpoint [{0}]")]
    InvalidEndpoint(String),

    #[error("destination [{0}] does not exist")]
    NoSuchDestination(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("a session with key [{key}] is already registered on [{endpoint}]")]
    DuplicateSession { key: String, endpoint: String },

    #[error("request carries no reply-to destination")]
    MissingReplyTo,

    #[error("session [{actual}] claimed to originate from session [{claimed}]")]
    SpoofedSessionOrigin { claimed: String, actual: String },
}

/// Every failure seen while releasing the resources of one context.
#[derive(Debug, Error)]
#[error("could not release {context}: {}", join_failures(.failures))]
pub struct ResourceCleanupError {
    pub context: String,
    pub failures: Vec<TransportError>,
}

fn join_failures(failures: &[TransportError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error("remote side failed to process the request: {0}")]
    Remote(String),

    #[error("no response received within {0:?}")]
    Timeout(Duration),

    #[error("request was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no command found for message type [{0}]")]
    NoCommand(String),

    #[error("WebSocket session [{0}] is closed")]
    SessionClosed(String),

    #[error("binary copy failed: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Command(String),

    #[error("send did not complete within {0:?}")]
    Timeout(Duration),

    #[error("binary send to session [{0}] was cancelled")]
    SendCancelled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_error_lists_every_failure() {
        let err = ResourceCleanupError {
            context: "producer context for queue://Orders".to_string(),
            failures: vec![
                TransportError::Other("producer exploded".to_string()),
                TransportError::Closed("session"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("queue://Orders"));
        assert!(text.contains("producer exploded"));
        assert!(text.contains("session is closed"));
    }

    #[test]
    fn bus_error_is_transparent_over_transport() {
        let err: BusError = TransportError::Publish("broker gone".to_string()).into();
        assert_eq!(err.to_string(), "publish failed: broker gone");
    }

    #[test]
    fn gateway_error_wraps_decode_error() {
        let err: GatewayError = DecodeError::UnknownType("cmdbus.api.Nope".to_string()).into();
        assert!(matches!(err, GatewayError::Decode(DecodeError::UnknownType(_))));
        assert!(err.to_string().contains("cmdbus.api.Nope"));
    }
}
