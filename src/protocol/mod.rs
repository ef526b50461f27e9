//! Binary chat protocol.
//!
//! Every frame is a big-endian `u32` type tag followed by the message
//! payload. There is no outer framing: a reader determines where a frame ends
//! from the tag and the embedded length prefixes alone.
//!
//! - `stream`: integer and length-prefixed byte codec
//! - `message`: request/response types and their payloads
//! - `serializer`: tag → decoder dispatch and frame encoding

mod error;
pub mod message;
pub mod serializer;
pub mod stream;

pub use error::DecodeError;
pub use message::{Ping, Pong, Request, RequestType, Response, ResponseType};
pub use serializer::Serializer;
