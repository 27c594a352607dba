//! The closed vocabulary of messages known to the default type registry.

use std::collections::HashMap;
use std::error::Error;

use serde::{Deserialize, Serialize};

use super::BasicMessage;

/// Free-form message used for simple notifications and by tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleBasicMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
}

impl SimpleBasicMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }
}

impl BasicMessage for SimpleBasicMessage {
    const TYPE_NAME: &'static str = "SimpleBasicMessage";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Authentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl BasicMessage for Authentication {
    const TYPE_NAME: &'static str = "Authentication";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EchoRequest {
    pub echo_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
}

impl EchoRequest {
    pub fn new(echo_message: impl Into<String>) -> Self {
        Self {
            echo_message: echo_message.into(),
            authentication: None,
        }
    }
}

impl BasicMessage for EchoRequest {
    const TYPE_NAME: &'static str = "EchoRequest";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EchoResponse {
    pub reply: String,
}

impl BasicMessage for EchoResponse {
    const TYPE_NAME: &'static str = "EchoResponse";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenericSuccessResponse {
    pub message: String,
}

impl BasicMessage for GenericSuccessResponse {
    const TYPE_NAME: &'static str = "GenericSuccessResponse";
}

/// Sent back to a peer whose request could not be processed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenericErrorResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl GenericErrorResponse {
    /// Builds a response from a summary line and the error that caused it.
    ///
    /// The stack trace is the error followed by each of its `source()`s, one
    /// per line.
    pub fn from_error(message: impl Into<String>, error: &(dyn Error + 'static)) -> Self {
        let mut trace = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push_str("\nCaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            error_message: Some(message.into()),
            stack_trace: Some(trace),
        }
    }
}

impl BasicMessage for GenericErrorResponse {
    const TYPE_NAME: &'static str = "GenericErrorResponse";
}

/// First message a UI client receives; tells it the id the server assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WelcomeResponse {
    pub session_id: String,
}

impl BasicMessage for WelcomeResponse {
    const TYPE_NAME: &'static str = "WelcomeResponse";
}

/// Asks a feed to run an operation on one of its resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteOperationRequest {
    pub feed_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
    pub operation_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
}

impl BasicMessage for ExecuteOperationRequest {
    const TYPE_NAME: &'static str = "ExecuteOperationRequest";

    fn sender_session_id_mut(&mut self) -> Option<&mut Option<String>> {
        Some(&mut self.sender_session_id)
    }

    fn destination_feed_id(&self) -> Option<&str> {
        Some(&self.feed_id)
    }
}

/// A feed's answer to an [`ExecuteOperationRequest`], routed back to the UI
/// session that asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteOperationResponse {
    pub operation_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_session_id: Option<String>,
}

impl BasicMessage for ExecuteOperationResponse {
    const TYPE_NAME: &'static str = "ExecuteOperationResponse";

    fn destination_session_id(&self) -> Option<&str> {
        self.destination_session_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedWebSocketClosedEvent {
    pub feed_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

impl BasicMessage for FeedWebSocketClosedEvent {
    const TYPE_NAME: &'static str = "FeedWebSocketClosedEvent";
}
