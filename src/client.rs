//! Minimal blocking client.
//!
//! Sends one request at a time and waits for its response. A failed round
//! trip is reported once; there is no retry.

use bytes::{Buf, BytesMut};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::protocol::{DecodeError, Ping, Request, Response, Serializer};

/// Read and write timeout applied to new connections.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum ClientError {
    Connect(io::Error),
    Io(io::Error),
    Decode(DecodeError),
    /// The server closed the connection before answering.
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connect(e) => write!(f, "Failed to connect: {}", e),
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Decode(e) => write!(f, "Malformed response: {}", e),
            ClientError::Disconnected => write!(f, "Server closed the connection"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Connect(e) | ClientError::Io(e) => Some(e),
            ClientError::Decode(e) => Some(e),
            ClientError::Disconnected => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<DecodeError> for ClientError {
    fn from(e: DecodeError) -> Self {
        ClientError::Decode(e)
    }
}

/// Answer to a ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    /// Payload echoed by the server.
    pub message: String,
    pub round_trip: Duration,
}

pub struct Client {
    stream: TcpStream,
    serializer: Serializer,
    inbound: BytesMut,
}

impl Client {
    /// Connect with [`DEFAULT_TIMEOUT`] on reads and writes.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        let mut client = Self {
            stream,
            serializer: Serializer::default(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
        };
        client.set_timeout(Some(DEFAULT_TIMEOUT))?;

        if let Ok(peer) = client.stream.peer_addr() {
            debug!(peer = %peer, "Connected");
        }
        Ok(client)
    }

    /// Change the read and write timeout. `None` blocks indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Send a ping carrying `message` and wait for the pong.
    pub fn ping(&mut self, message: &str) -> Result<PingReply, ClientError> {
        let started = Instant::now();
        let response = self.request(&Request::Ping(Ping::new(message)))?;
        let round_trip = started.elapsed();

        match response {
            Response::Pong(pong) => {
                trace!(round_trip_us = round_trip.as_micros() as u64, "Pong received");
                Ok(PingReply {
                    message: pong.message,
                    round_trip,
                })
            }
        }
    }

    /// Send one request and wait for exactly one response.
    pub fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
        let frame = self.serializer.encode_request(request);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<Response, ClientError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some((response, consumed)) =
                self.serializer.try_decode_response(&self.inbound)?
            {
                self.inbound.advance(consumed);
                return Ok(response);
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ClientError::Disconnected),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
    }
}
