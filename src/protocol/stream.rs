//! Byte stream codec.
//!
//! All multi-byte integers are written in network byte order (big-endian)
//! regardless of host endianness. The only variable-length primitive is the
//! length-prefixed byte sequence: a `u32` length followed by the raw bytes.
//! Strings and blobs both go through it.
//!
//! Reading never panics and never indexes past the end of the input: every
//! read is bounds-checked against the bytes actually remaining, and a length
//! prefix is checked against both the reader's limit and the remaining input
//! before anything is allocated.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::DecodeError;

/// Size in bytes of a length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// A fixed-width integer that can travel over the wire.
pub trait WireInt: Sized + Copy {
    /// Encoded width in bytes.
    const SIZE: usize;

    fn put(self, buf: &mut BytesMut);

    /// Caller guarantees `buf` holds at least `SIZE` bytes.
    fn get(buf: &mut &[u8]) -> Self;
}

macro_rules! wire_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl WireInt for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn put(self, buf: &mut BytesMut) {
                    buf.$put(self);
                }

                fn get(buf: &mut &[u8]) -> Self {
                    buf.$get()
                }
            }
        )*
    };
}

wire_int! {
    i8 => put_i8, get_i8;
    u8 => put_u8, get_u8;
    i16 => put_i16, get_i16;
    u16 => put_u16, get_u16;
    i32 => put_i32, get_i32;
    u32 => put_u32, get_u32;
    i64 => put_i64, get_i64;
    u64 => put_u64, get_u64;
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append a fixed-width integer.
    pub fn write<T: WireInt>(&mut self, value: T) -> &mut Self {
        value.put(&mut self.buf);
        self
    }

    /// Append a `u32` length header followed by `data`.
    ///
    /// # Panics
    /// Panics if `data` is longer than `u32::MAX` bytes, which no frame
    /// produced by this crate can reach.
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        let len = u32::try_from(data.len()).expect("length-prefixed field exceeds u32::MAX");
        self.buf.put_u32(len);
        self.buf.put_slice(data);
        self
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_bytes(value.as_bytes())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Freeze the written bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a borrowed input range.
///
/// The cursor only moves forward, and only after a read has been validated.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    consumed: usize,
    max_len: usize,
}

impl<'a> ByteReader<'a> {
    /// Reader accepting any length prefix that fits in the input.
    pub fn new(buf: &'a [u8]) -> Self {
        Self::with_limit(buf, u32::MAX as usize)
    }

    /// Reader rejecting length prefixes larger than `max_len`.
    pub fn with_limit(buf: &'a [u8], max_len: usize) -> Self {
        Self {
            buf,
            consumed: 0,
            max_len,
        }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Bytes read so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Read a fixed-width integer.
    pub fn read<T: WireInt>(&mut self) -> Result<T, DecodeError> {
        self.ensure(T::SIZE)?;
        let value = T::get(&mut self.buf);
        self.consumed += T::SIZE;
        Ok(value)
    }

    /// Read a length-prefixed byte sequence, borrowing from the input.
    ///
    /// On failure the cursor is left where it was.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        self.ensure(LENGTH_PREFIX_SIZE)?;
        let mut prefix = &self.buf[..LENGTH_PREFIX_SIZE];
        let len = prefix.get_u32() as usize;
        if len > self.max_len {
            return Err(DecodeError::LengthTooLarge {
                length: len,
                limit: self.max_len,
            });
        }
        self.ensure(LENGTH_PREFIX_SIZE + len)?;

        let data = &self.buf[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len];
        self.buf = &self.buf[LENGTH_PREFIX_SIZE + len..];
        self.consumed += LENGTH_PREFIX_SIZE + len;
        Ok(data)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let checkpoint = self.clone();
        let data = self.read_bytes()?;
        match std::str::from_utf8(data) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => {
                *self = checkpoint;
                Err(DecodeError::InvalidUtf8)
            }
        }
    }
}
