//! The `codec` module turns messages into envelopes and back.
//!
//! The text form of an envelope is `TypeName=JSON`. The binary form is the
//! same bytes immediately followed by an arbitrary attachment; a reader can
//! take the message off the front of such a stream and hand the remainder to
//! whoever needs it, without buffering it first.

mod attachment;
mod registry;

use std::io::{self, Cursor, ErrorKind, Read};

pub use attachment::Attachment;
pub use registry::{DEFAULT_NAMESPACE, TypeRegistry, default_registry};

use crate::message::{AnyMessage, BasicMessage, FromDecoded};
use crate::utils::error::{DecodeError, EncodeError};

/// Separates the type name from the JSON body.
pub const SEPARATOR: u8 = b'=';

/// Longest type name accepted while scanning a stream.
pub const MAX_TYPE_NAME_LEN: usize = 512;

/// Attachment of a message received from the bus or from a WebSocket.
pub type BinaryData = Attachment<Box<dyn Read + Send>>;

/// Reader yielding an encoded message followed by its attachment.
pub type EnvelopeReader<R> = io::Chain<Cursor<Vec<u8>>, R>;

const PREVIEW_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct Codec {
    registry: TypeRegistry,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(default_registry())
    }
}

impl Codec {
    pub fn new(registry: TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn encode(message: &dyn AnyMessage) -> Result<String, EncodeError> {
        let json = message.to_json().map_err(|source| EncodeError::Json {
            type_name: message.type_name(),
            source,
        })?;
        Ok(format!("{}={json}", message.type_name()))
    }

    /// Encodes `message` and drains `attachment` right behind it.
    pub fn encode_with_attachment<R: Read>(
        message: &dyn AnyMessage,
        mut attachment: R,
    ) -> Result<Vec<u8>, EncodeError> {
        let mut bytes = Self::encode(message)?.into_bytes();
        attachment.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Streaming counterpart of [`Codec::encode_with_attachment`].
    pub fn envelope_reader<R: Read>(
        message: &dyn AnyMessage,
        attachment: R,
    ) -> Result<EnvelopeReader<R>, EncodeError> {
        Ok(Cursor::new(Self::encode(message)?.into_bytes()).chain(attachment))
    }

    pub fn decode(&self, envelope: &str) -> Result<Box<dyn AnyMessage>, DecodeError> {
        let Some((type_name, json)) = envelope.split_once('=') else {
            return Err(DecodeError::MissingSeparator(preview(envelope)));
        };
        let decoder = self.registry.resolve(type_name)?;
        (decoder.from_str)(json).map_err(|source| DecodeError::InvalidJson {
            type_name: decoder.qualified_name.clone(),
            source,
        })
    }

    /// Decodes and checks the message is a `T`.
    pub fn decode_typed<T: BasicMessage>(&self, envelope: &str) -> Result<T, DecodeError> {
        convert(self.decode(envelope)?)
    }

    /// Takes one message off the front of `reader`.
    ///
    /// The reader is never closed; whatever follows the JSON object is
    /// returned untouched as the attachment.
    pub fn decode_stream<R: Read>(
        &self,
        mut reader: R,
    ) -> Result<(Box<dyn AnyMessage>, Attachment<R>), DecodeError> {
        let type_name = read_type_name(&mut reader)?;
        let decoder = self.registry.resolve(&type_name)?;
        let message =
            (decoder.from_reader)(&mut reader).map_err(|source| DecodeError::InvalidJson {
                type_name: decoder.qualified_name.clone(),
                source,
            })?;
        Ok((message, Attachment::new(reader)))
    }

    pub fn decode_stream_typed<T: BasicMessage, R: Read>(
        &self,
        reader: R,
    ) -> Result<(T, Attachment<R>), DecodeError> {
        let (message, attachment) = self.decode_stream(reader)?;
        Ok((convert(message)?, attachment))
    }
}

/// Converts a decoded message into what a receiver asked for.
pub(crate) fn convert<M: FromDecoded>(message: Box<dyn AnyMessage>) -> Result<M, DecodeError> {
    M::from_decoded(message).map_err(|other| DecodeError::UnexpectedType {
        expected: M::expected_type(),
        actual: other.type_name(),
    })
}

fn read_type_name<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(DecodeError::UnexpectedEof),
            Ok(_) if byte[0] == SEPARATOR => break,
            Ok(_) => {
                if name.len() == MAX_TYPE_NAME_LEN {
                    return Err(DecodeError::TypeNameTooLong(MAX_TYPE_NAME_LEN));
                }
                name.push(byte[0]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    String::from_utf8(name).map_err(|_| DecodeError::InvalidTypeName)
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(PREVIEW_LEN) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests;
