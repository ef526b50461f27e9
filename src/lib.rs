//! chat-server: a TCP request/response chat server
//!
//! - Binary protocol with big-endian integers and length-prefixed fields
//! - One dispatch thread driving a readiness loop over every connection
//! - Fixed worker pool running one request cycle per ready connection
//! - Zombie connections (disconnected, faulty, or idle) reaped by the
//!   dispatch thread once no worker holds them
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod handler;
pub mod protocol;
pub mod runtime;
pub mod server;
#[cfg(unix)]
pub mod signals;

pub use client::{Client, ClientError, PingReply};
pub use config::{Config, ConfigError};
pub use handler::{ChatHandler, RequestHandler};
pub use runtime::ServerState;
pub use server::{Server, ServerError, ServerStats, StopHandle};
#[cfg(unix)]
pub use signals::SignalWatch;
