//! Request/response message model.
//!
//! Requests travel client → server, responses server → client. Each concrete
//! message owns its payload and knows how to write it and, given a reader
//! positioned just past its type tag, how to read it back. Tags are assigned
//! per direction, so a request and a response may share a tag value.
//!
//! ```text
//! Ping (request, tag 0):  u32 tag | u32 len | message bytes
//! Pong (response, tag 0): u32 tag | u32 len | message bytes
//! ```

use super::error::DecodeError;
use super::stream::{ByteReader, ByteWriter};

/// Wire tags for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestType {
    Ping = 0,
}

/// Wire tags for responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseType {
    Pong = 0,
}

/// Behaviour shared by every concrete message.
pub trait Message {
    /// Type tag written ahead of the payload.
    fn tag(&self) -> u32;

    /// Write the payload (everything after the tag).
    fn encode_payload(&self, out: &mut ByteWriter);
}

/// Construct a message from the payload that follows its tag.
pub trait DecodePayload: Sized {
    fn decode_payload(input: &mut ByteReader<'_>) -> Result<Self, DecodeError>;
}

/// Liveness check. An empty message means no echo text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ping {
    pub message: String,
}

impl Ping {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Message for Ping {
    fn tag(&self) -> u32 {
        RequestType::Ping as u32
    }

    fn encode_payload(&self, out: &mut ByteWriter) {
        out.write_str(&self.message);
    }
}

impl DecodePayload for Ping {
    fn decode_payload(input: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            message: input.read_string()?,
        })
    }
}

/// Reply to a [`Ping`], echoing its message verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pong {
    pub message: String,
}

impl Pong {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Message for Pong {
    fn tag(&self) -> u32 {
        ResponseType::Pong as u32
    }

    fn encode_payload(&self, out: &mut ByteWriter) {
        out.write_str(&self.message);
    }
}

impl DecodePayload for Pong {
    fn decode_payload(input: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            message: input.read_string()?,
        })
    }
}

/// Every request the server understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping(Ping),
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        match self {
            Request::Ping(_) => RequestType::Ping,
        }
    }

    pub(crate) fn as_message(&self) -> &dyn MessageBody {
        match self {
            Request::Ping(ping) => ping,
        }
    }
}

impl From<Ping> for Request {
    fn from(ping: Ping) -> Self {
        Request::Ping(ping)
    }
}

/// Every response the server can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pong(Pong),
}

impl Response {
    pub fn response_type(&self) -> ResponseType {
        match self {
            Response::Pong(_) => ResponseType::Pong,
        }
    }

    pub(crate) fn as_message(&self) -> &dyn MessageBody {
        match self {
            Response::Pong(pong) => pong,
        }
    }
}

impl From<Pong> for Response {
    fn from(pong: Pong) -> Self {
        Response::Pong(pong)
    }
}

/// Object-safe view of [`Message`] used by the serializer.
pub(crate) trait MessageBody {
    fn wire_tag(&self) -> u32;
    fn write_body(&self, out: &mut ByteWriter);
}

impl<M: Message> MessageBody for M {
    fn wire_tag(&self) -> u32 {
        self.tag()
    }

    fn write_body(&self, out: &mut ByteWriter) {
        self.encode_payload(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        assert_eq!(Ping::default().tag(), 0);
        assert_eq!(Pong::default().tag(), 0);
    }

    #[test]
    fn test_ping_payload() {
        let mut out = ByteWriter::new();
        Ping::new("hi").encode_payload(&mut out);
        assert_eq!(out.as_slice(), b"\x00\x00\x00\x02hi");

        let mut reader = ByteReader::new(out.as_slice());
        assert_eq!(Ping::decode_payload(&mut reader), Ok(Ping::new("hi")));
    }

    #[test]
    fn test_truncated_pong_payload() {
        let mut reader = ByteReader::new(b"\x00\x00\x00\x05hel");
        assert!(matches!(
            Pong::decode_payload(&mut reader),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
