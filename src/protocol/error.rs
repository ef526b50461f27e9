//! Decode errors for the binary wire protocol.

use std::fmt;

/// Reasons a byte sequence could not be decoded into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remain than the field being read requires.
    Truncated { needed: usize, remaining: usize },
    /// A length prefix declares more bytes than the reader accepts.
    LengthTooLarge { length: usize, limit: usize },
    /// The leading type tag matches no registered message.
    UnknownType { tag: u32 },
    /// A string field is not valid UTF-8.
    InvalidUtf8,
}

impl DecodeError {
    /// Whether more input could turn this failure into a successful decode.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Truncated { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, remaining } => {
                write!(f, "truncated input: needed {needed} bytes, {remaining} remaining")
            }
            DecodeError::LengthTooLarge { length, limit } => {
                write!(f, "length prefix {length} exceeds limit {limit}")
            }
            DecodeError::UnknownType { tag } => write!(f, "unknown message type tag {tag}"),
            DecodeError::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}
