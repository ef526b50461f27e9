//! Server control surface.
//!
//! `Server::new` performs every check that can fail at startup (capacity,
//! address, bind), so a server that was constructed can always be started.
//! The dispatch loop then runs on its own thread until `stop`.

use std::fmt;
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

use crate::config::Config;
use crate::handler::{ChatHandler, RequestHandler};
use crate::protocol::Serializer;
use crate::runtime::{DispatchLoop, LoopSettings, LoopStats, ServerState, SharedState};

/// Smallest usable capacity: the dispatch thread plus one worker.
pub const MIN_THREADS: usize = 2;

/// Startup failures. All of them are fatal.
#[derive(Debug)]
pub enum ServerError {
    InvalidCapacity { max_threads: usize },
    InvalidAddress(String, AddrParseError),
    Bind(SocketAddr, io::Error),
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidCapacity { max_threads } => write!(
                f,
                "Max thread count cannot be less than {} (got {})",
                MIN_THREADS, max_threads
            ),
            ServerError::InvalidAddress(addr, e) => {
                write!(f, "Invalid listen address '{}': {}", addr, e)
            }
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ServerError::Io(e) => write!(f, "Server I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidCapacity { .. } => None,
            ServerError::InvalidAddress(_, e) => Some(e),
            ServerError::Bind(_, e) | ServerError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Point-in-time view of the dispatch loop's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub accepted: u64,
    pub dispatched: u64,
    pub reaped: u64,
    /// Read, decode and write faults across all connections.
    pub faults: u64,
    pub live: usize,
}

/// Requests a stop from any thread without joining.
#[derive(Debug, Clone)]
pub struct StopHandle {
    state: Arc<SharedState>,
}

impl StopHandle {
    /// Ask a running server to stop. Has no effect in any other state.
    pub fn stop(&self) {
        if self
            .state
            .transition(ServerState::Running, ServerState::Stopping)
        {
            info!("Server stopping...");
        }
    }
}

pub struct Server {
    local_addr: SocketAddr,
    dispatch: Option<DispatchLoop>,
    thread: Option<JoinHandle<io::Result<()>>>,
    state: Arc<SharedState>,
    stats: Arc<LoopStats>,
}

impl Server {
    /// Build a server answering with the built-in handler.
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        Self::with_handler(config, ChatHandler)
    }

    /// Build a server answering with `handler`.
    pub fn with_handler<H: RequestHandler>(
        config: &Config,
        handler: H,
    ) -> Result<Self, ServerError> {
        if config.max_threads < MIN_THREADS {
            error!(max_threads = config.max_threads, "Max thread count too low");
            return Err(ServerError::InvalidCapacity {
                max_threads: config.max_threads,
            });
        }

        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| ServerError::InvalidAddress(config.listen.clone(), e))?;
        let listener = bind(addr).map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(SharedState::new());
        let stats = Arc::new(LoopStats::default());
        let settings = LoopSettings {
            workers: config.max_threads - 1,
            poll_timeout: config.poll_timeout(),
            limits: config.session_limits(),
            serializer: Serializer::new(config.max_frame_size),
        };
        let dispatch = DispatchLoop::new(
            listener,
            Arc::new(handler),
            settings,
            Arc::clone(&state),
            Arc::clone(&stats),
        )?;

        info!(address = %local_addr, max_threads = config.max_threads, "Server listening");

        Ok(Self {
            local_addr,
            dispatch: Some(dispatch),
            thread: None,
            state,
            stats,
        })
    }

    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            reaped: self.stats.reaped.load(Ordering::Relaxed),
            faults: self.stats.faults.load(Ordering::Relaxed),
            live: self.stats.live.load(Ordering::Relaxed),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Spawn the dispatch thread. A second call is a no-op.
    pub fn start(&mut self) -> Result<(), ServerError> {
        let dispatch = match self.dispatch.take() {
            Some(dispatch) => dispatch,
            None => return Ok(()),
        };

        info!("Server starting...");
        self.state.set(ServerState::Running);

        let spawned = thread::Builder::new()
            .name("chat-dispatch".to_string())
            .spawn(move || dispatch.run());
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!(address = %self.local_addr, "Server started");
                Ok(())
            }
            Err(e) => {
                self.state.set(ServerState::Stopped);
                Err(ServerError::Io(e))
            }
        }
    }

    /// Stop accepting, drain in-flight jobs, and join the dispatch thread.
    pub fn stop(&mut self) {
        self.stop_handle().stop();

        let handle = match self.thread.take() {
            Some(handle) => handle,
            None => return,
        };
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Dispatch loop exited with error"),
            Err(_) => error!("Dispatch thread panicked"),
        }
        self.state.set(ServerState::Stopped);
        info!("Server stopped");
    }

    /// Whether the dispatch thread has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::protocol::{Ping, Pong, Request, Response};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_threads: 3,
            poll_timeout_ms: 20,
            ..Config::default()
        }
    }

    fn running_server() -> Server {
        let mut server = Server::new(&test_config()).unwrap();
        server.start().unwrap();
        server
    }

    fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_capacity_below_two_rejected() {
        for max_threads in [0, 1] {
            let config = Config {
                max_threads,
                ..test_config()
            };
            assert!(matches!(
                Server::new(&config),
                Err(ServerError::InvalidCapacity { .. })
            ));
        }
    }

    #[test]
    fn test_invalid_address_rejected() {
        let config = Config {
            listen: "not an address".to_string(),
            ..test_config()
        };
        assert!(matches!(
            Server::new(&config),
            Err(ServerError::InvalidAddress(_, _))
        ));
    }

    #[test]
    fn test_port_in_use_rejected() {
        let first = Server::new(&test_config()).unwrap();
        let config = Config {
            listen: first.local_addr().to_string(),
            ..test_config()
        };
        assert!(matches!(Server::new(&config), Err(ServerError::Bind(_, _))));
    }

    #[test]
    fn test_lifecycle() {
        let mut server = Server::new(&test_config()).unwrap();
        assert_eq!(server.state(), ServerState::Idle);

        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Running);

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.is_finished());

        // Stopping twice is harmless.
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_stop_handle_from_other_thread() {
        let mut server = running_server();
        let handle = server.stop_handle();
        thread::spawn(move || handle.stop()).join().unwrap();

        wait_for("dispatch thread exit", || server.is_finished());
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_ping_round_trip() {
        let server = running_server();
        let mut client = Client::connect(server.local_addr()).unwrap();

        let reply = client.ping("hello").unwrap();
        assert_eq!(reply.message, "hello");

        let reply = client.ping("").unwrap();
        assert_eq!(reply.message, "");
    }

    #[test]
    fn test_many_pings_on_one_connection() {
        let server = running_server();
        let mut client = Client::connect(server.local_addr()).unwrap();
        for i in 0..50 {
            let message = format!("ping {}", i);
            assert_eq!(client.ping(&message).unwrap().message, message);
        }
    }

    #[test]
    fn test_concurrent_clients() {
        let server = running_server();
        let addr = server.local_addr();

        let clients: Vec<_> = (0..8)
            .map(|c| {
                thread::spawn(move || {
                    let mut client = Client::connect(addr).unwrap();
                    for i in 0..20 {
                        let message = format!("client {} ping {}", c, i);
                        assert_eq!(client.ping(&message).unwrap().message, message);
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        assert_eq!(server.stats().accepted, 8);
    }

    #[test]
    fn test_custom_handler() {
        let handler = |request: Request| match request {
            Request::Ping(ping) => Response::Pong(Pong::new(
                ping.message.to_uppercase(),
            )),
        };
        let mut server = Server::with_handler(&test_config(), handler).unwrap();
        server.start().unwrap();

        let mut client = Client::connect(server.local_addr()).unwrap();
        assert_eq!(client.ping("quiet").unwrap().message, "QUIET");
    }

    #[test]
    fn test_disconnected_connection_reaped_once() {
        let server = running_server();

        let stream = TcpStream::connect(server.local_addr()).unwrap();
        wait_for("accept", || server.stats().live == 1);

        drop(stream);
        wait_for("reap", || server.stats().live == 0);
        assert_eq!(server.stats().reaped, 1);

        // Further iterations must not touch it again.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.stats().reaped, 1);
        assert_eq!(server.stats().accepted, 1);
    }

    #[test]
    fn test_decode_fault_is_local() {
        let server = running_server();
        let serializer = Serializer::default();

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Unknown request type 9 with an empty body.
        stream.write_all(&[0, 0, 0, 9, 0, 0, 0, 0]).unwrap();
        wait_for("decode fault", || server.stats().faults == 1);

        let frame = serializer.encode_request(&Request::Ping(Ping::new("hi")));
        stream.write_all(&frame).unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).unwrap();
        let (response, consumed) = serializer.try_decode_response(&reply).unwrap().unwrap();
        assert_eq!(consumed, reply.len());
        assert_eq!(response, Response::Pong(Pong::new("hi")));

        // Another client is unaffected.
        let mut client = Client::connect(server.local_addr()).unwrap();
        assert_eq!(client.ping("still here").unwrap().message, "still here");
        assert_eq!(server.stats().faults, 1);
        assert_eq!(server.stats().reaped, 0);
    }

    #[test]
    fn test_flooding_client_is_answered_in_full() {
        let config = Config {
            max_frame_size: 1024,
            ..test_config()
        };
        let mut server = Server::new(&config).unwrap();
        server.start().unwrap();
        let serializer = Serializer::default();

        let stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Far more than one read budget, sent in one burst.
        let count = 20_000;
        let frame = serializer.encode_request(&Request::Ping(Ping::new("flood")));
        let burst: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * count).collect();
        let mut writer = stream.try_clone().unwrap();
        let sender = thread::spawn(move || writer.write_all(&burst).unwrap());

        let pong = serializer.encode_response(&Response::Pong(Pong::new("flood")));
        let mut reader = stream;
        let mut replies = vec![0u8; pong.len() * count];
        reader.read_exact(&mut replies).unwrap();
        sender.join().unwrap();

        assert!(replies.chunks(pong.len()).all(|reply| reply == &pong[..]));
        assert_eq!(server.stats().faults, 0);
    }

    #[test]
    fn test_repeated_faults_close_connection() {
        let server = running_server();

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Default limit tolerates three faults; the fourth makes it a zombie.
        for fault in 1..=4 {
            stream.write_all(&[0, 0, 0, 9, 0, 0, 0, 0]).unwrap();
            wait_for("decode fault", || server.stats().faults == fault);
        }

        wait_for("reap", || server.stats().reaped == 1);

        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    #[test]
    fn test_idle_timeout_reaps_silent_connection() {
        let config = Config {
            idle_timeout_secs: 1,
            ..test_config()
        };
        let mut server = Server::new(&config).unwrap();
        server.start().unwrap();

        let _stream = TcpStream::connect(server.local_addr()).unwrap();
        wait_for("accept", || server.stats().accepted == 1);
        wait_for("idle reap", || server.stats().reaped == 1);
        assert_eq!(server.stats().live, 0);
    }

    #[test]
    fn test_stop_with_open_connections() {
        let mut server = running_server();
        let mut client = Client::connect(server.local_addr()).unwrap();
        assert_eq!(client.ping("before").unwrap().message, "before");

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.stats().live, 0);
        assert!(client.ping("after").is_err());
    }
}
