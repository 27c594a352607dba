//! # cmdbus
//!
//! `cmdbus` carries typed messages over a message broker and bridges them to
//! WebSocket clients. Every message travels in one envelope,
//! `TypeName=JSON`, optionally followed by raw attachment bytes.
//!
//! ## Core Modules
//!
//! - `message`: The message model and the known message types.
//! - `codec`: Encoding and decoding of envelopes, including streamed attachments.
//! - `broker`: The broker abstraction and an in-process broker implementing it.
//! - `context`: Bundles of connection, session, destination and producer or consumer, released together.
//! - `processor`: Sending, listening, and request/response on top of contexts.
//! - `gateway`: The WebSocket command gateway for feeds and UI clients.
//! - `config`: Loading the server configuration.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod codec;
pub mod config;
pub mod context;
pub mod gateway;
pub mod message;
pub mod processor;
pub mod utils;
