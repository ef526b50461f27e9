//! Request handling.
//!
//! A handler maps one decoded request to one response. It performs no I/O
//! and touches no shared state, so the connection cycle and dispatch loop
//! can be exercised without any business logic behind them.

use crate::protocol::{Ping, Pong, Request, Response};

/// Maps requests to responses.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Response;
}

/// The server's built-in request handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatHandler;

impl ChatHandler {
    fn ping(&self, ping: Ping) -> Pong {
        Pong {
            message: ping.message,
        }
    }
}

impl RequestHandler for ChatHandler {
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping(ping) => Response::Pong(self.ping(ping)),
        }
    }
}

impl<F> RequestHandler for F
where
    F: Fn(Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: Request) -> Response {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_echoes_message() {
        let response = ChatHandler.handle(Request::Ping(Ping::new("hello")));
        assert_eq!(response, Response::Pong(Pong::new("hello")));
    }

    #[test]
    fn test_empty_ping() {
        let response = ChatHandler.handle(Request::Ping(Ping::default()));
        assert_eq!(response, Response::Pong(Pong::default()));
    }

    #[test]
    fn test_closure_handler() {
        let handler = |_: Request| Response::Pong(Pong::new("fixed"));
        let response = handler.handle(Request::Ping(Ping::new("ignored")));
        assert_eq!(response, Response::Pong(Pong::new("fixed")));
    }
}
