//! Tag-driven message serialization.
//!
//! The serializer is the only place that knows which tag maps to which
//! message type. Decoding reads the leading `u32` tag, looks it up in the
//! decoder table for the expected direction and hands the rest of the input
//! to that type's payload decoder. An unknown tag is an error; nothing is
//! constructed for it.

use bytes::Bytes;

use super::error::DecodeError;
use super::message::{
    DecodePayload, MessageBody, Ping, Pong, Request, RequestType, Response, ResponseType,
};
use super::stream::{ByteReader, ByteWriter};

/// Default upper bound on any single length-prefixed field (1 MiB).
pub const DEFAULT_MAX_FIELD_LEN: usize = 1024 * 1024;

/// Size in bytes of the leading type tag.
pub const TAG_SIZE: usize = 4;

type Decoder<T> = fn(&mut ByteReader<'_>) -> Result<T, DecodeError>;

fn decode_as<M, T>(input: &mut ByteReader<'_>) -> Result<T, DecodeError>
where
    M: DecodePayload + Into<T>,
{
    M::decode_payload(input).map(Into::into)
}

const REQUEST_DECODERS: &[(RequestType, Decoder<Request>)] =
    &[(RequestType::Ping, decode_as::<Ping, Request>)];

const RESPONSE_DECODERS: &[(ResponseType, Decoder<Response>)] =
    &[(ResponseType::Pong, decode_as::<Pong, Response>)];

fn request_decoder(tag: u32) -> Option<Decoder<Request>> {
    REQUEST_DECODERS
        .iter()
        .find(|(ty, _)| *ty as u32 == tag)
        .map(|(_, decoder)| *decoder)
}

fn response_decoder(tag: u32) -> Option<Decoder<Response>> {
    RESPONSE_DECODERS
        .iter()
        .find(|(ty, _)| *ty as u32 == tag)
        .map(|(_, decoder)| *decoder)
}

/// Encodes outbound messages and decodes inbound frames.
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    max_field_len: usize,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIELD_LEN)
    }
}

impl Serializer {
    /// Create a serializer rejecting length prefixes above `max_field_len`.
    pub fn new(max_field_len: usize) -> Self {
        Self { max_field_len }
    }

    pub fn max_field_len(&self) -> usize {
        self.max_field_len
    }

    fn encode(body: &dyn MessageBody) -> Bytes {
        let mut out = ByteWriter::with_capacity(64);
        out.write(body.wire_tag());
        body.write_body(&mut out);
        out.into_bytes()
    }

    pub fn encode_request(&self, request: &Request) -> Bytes {
        Self::encode(request.as_message())
    }

    pub fn encode_response(&self, response: &Response) -> Bytes {
        Self::encode(response.as_message())
    }

    /// Decode one request from `input`.
    pub fn decode_request(&self, input: &mut ByteReader<'_>) -> Result<Request, DecodeError> {
        let tag = input.read::<u32>()?;
        let decoder = request_decoder(tag).ok_or(DecodeError::UnknownType { tag })?;
        decoder(input)
    }

    /// Decode one response from `input`.
    pub fn decode_response(&self, input: &mut ByteReader<'_>) -> Result<Response, DecodeError> {
        let tag = input.read::<u32>()?;
        let decoder = response_decoder(tag).ok_or(DecodeError::UnknownType { tag })?;
        decoder(input)
    }

    /// Decode a request from the front of a stream buffer.
    ///
    /// Returns `Ok(None)` while `input` holds only a prefix of a frame, and the
    /// decoded request with the number of bytes it occupied once complete.
    pub fn try_decode_request(
        &self,
        input: &[u8],
    ) -> Result<Option<(Request, usize)>, DecodeError> {
        let mut reader = ByteReader::with_limit(input, self.max_field_len);
        frame_result(self.decode_request(&mut reader), &reader)
    }

    /// Decode a response from the front of a stream buffer.
    pub fn try_decode_response(
        &self,
        input: &[u8],
    ) -> Result<Option<(Response, usize)>, DecodeError> {
        let mut reader = ByteReader::with_limit(input, self.max_field_len);
        frame_result(self.decode_response(&mut reader), &reader)
    }
}

fn frame_result<T>(
    result: Result<T, DecodeError>,
    reader: &ByteReader<'_>,
) -> Result<Option<(T, usize)>, DecodeError> {
    match result {
        Ok(message) => Ok(Some((message, reader.consumed()))),
        Err(e) if e.is_incomplete() => Ok(None),
        Err(e) => Err(e),
    }
}
