//! Readiness-driven dispatch loop.
//!
//! One thread owns the listener, the poll registration of every socket and
//! the connection registry. Each turn it:
//!
//! 1. polls with a bounded timeout, so a stop request is seen promptly even
//!    with no traffic;
//! 2. accepts every pending connection (before any per-connection dispatch);
//! 3. marks ready, idle, live connections busy and submits one handling job
//!    per connection to the worker pool;
//! 4. reaps connections that are zombies and not busy, deregistering each
//!    socket before dropping it.
//!
//! mio readiness is edge-triggered: a readiness event for a connection that is
//! busy is remembered in the registry and dispatched on a later turn, once the
//! worker has released it. A job that stops at its read budget leaves the
//! connection pending and wakes the poll, so the rest of the input is served
//! on the next turn without another socket event.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::handler::RequestHandler;
use crate::protocol::Serializer;
use crate::runtime::connection::{Connection, ConnectionRegistry, SessionLimits};
use crate::runtime::pool::WorkerPool;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Upper bound on simultaneously open client connections.
pub const MAX_CONNECTIONS: usize = 10_000;

/// Lifecycle of a server's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Constructed, not yet started.
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Running,
            2 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

/// State shared between the dispatch thread and whoever controls it.
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ServerState::Idle as u8))
    }

    pub(crate) fn get(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from` → `to`; returns whether the transition happened.
    pub(crate) fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Counters maintained by the dispatch thread.
#[derive(Debug, Default)]
pub(crate) struct LoopStats {
    pub(crate) accepted: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) reaped: AtomicU64,
    /// Read, decode and write faults across all connections.
    pub(crate) faults: AtomicU64,
    pub(crate) live: AtomicUsize,
}

/// Settings the dispatch loop is built with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopSettings {
    pub(crate) workers: usize,
    pub(crate) poll_timeout: Duration,
    pub(crate) limits: SessionLimits,
    pub(crate) serializer: Serializer,
}

/// The session manager: listener, live connections, and the worker pool.
pub(crate) struct DispatchLoop {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    pool: WorkerPool,
    handler: Arc<dyn RequestHandler>,
    settings: LoopSettings,
    state: Arc<SharedState>,
    stats: Arc<LoopStats>,
}

impl DispatchLoop {
    pub(crate) fn new(
        listener: std::net::TcpListener,
        handler: Arc<dyn RequestHandler>,
        settings: LoopSettings,
        state: Arc<SharedState>,
        stats: Arc<LoopStats>,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let pool = WorkerPool::new(settings.workers)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            waker,
            listener,
            registry: ConnectionRegistry::new(MAX_CONNECTIONS),
            pool,
            handler,
            settings,
            state,
            stats,
        })
    }

    /// Run until a stop is requested, then drain the pool.
    pub(crate) fn run(mut self) -> io::Result<()> {
        info!(
            workers = self.pool.size(),
            max_connections = self.registry.capacity(),
            poll_timeout_ms = self.settings.poll_timeout.as_millis() as u64,
            "Dispatch loop running"
        );

        let mut result = Ok(());
        while self.state.get() == ServerState::Running {
            if let Err(e) = self.turn() {
                error!(error = %e, "Dispatch loop failed");
                result = Err(e);
                break;
            }
        }

        self.state.set(ServerState::Stopping);
        self.shutdown();
        self.state.set(ServerState::Stopped);
        result
    }

    /// One poll → accept → dispatch → reap iteration.
    fn turn(&mut self) -> io::Result<()> {
        match self
            .poll
            .poll(&mut self.events, Some(self.settings.poll_timeout))
        {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut listener_ready = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => listener_ready = true,
                WAKER_TOKEN => {}
                Token(conn_id) => self.registry.mark_ready(conn_id),
            }
        }

        if listener_ready {
            self.accept_connections();
        }
        self.dispatch_ready();
        self.reap_zombies();
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_connection(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Could not accept connection");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let conn_id = match self.registry.next_id() {
            Some(id) => id,
            None => {
                warn!(peer = %peer, limit = self.registry.capacity(), "Connection limit reached");
                return;
            }
        };

        if let Err(e) =
            self.poll
                .registry()
                .register(&mut stream, Token(conn_id), Interest::READABLE)
        {
            warn!(peer = %peer, error = %e, "Could not register connection");
            return;
        }

        let conn = Connection::new(conn_id, peer, stream, self.settings.limits);
        if self.registry.insert(conn).is_none() {
            // next_id just confirmed there was room.
            warn!(peer = %peer, "Connection limit reached");
            return;
        }
        // Data may have arrived with the handshake, before registration.
        self.registry.mark_ready(conn_id);

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.live.store(self.registry.len(), Ordering::Relaxed);
        info!(conn_id, peer = %peer, "Connection accepted");
    }

    fn dispatch_ready(&mut self) {
        let pool = &self.pool;
        let handler = &self.handler;
        let waker = &self.waker;
        let stats = &self.stats;
        let serializer = self.settings.serializer;

        let dispatched = self.registry.dispatch_ready(|conn| {
            let handler = Arc::clone(handler);
            let waker = Arc::clone(waker);
            let stats = Arc::clone(stats);
            pool.submit(move || {
                let fails_before = conn.fail_count();
                let more_pending = conn.handle(&*handler, &serializer);
                let faults = conn.fail_count().saturating_sub(fails_before);
                if faults > 0 {
                    stats.faults.fetch_add(u64::from(faults), Ordering::Relaxed);
                }
                if more_pending {
                    if let Err(e) = waker.wake() {
                        debug!(conn_id = conn.id(), error = %e, "Wake failed");
                    }
                }
            })
            .is_ok()
        });

        if dispatched > 0 {
            self.stats
                .dispatched
                .fetch_add(dispatched as u64, Ordering::Relaxed);
        }
    }

    fn reap_zombies(&mut self) {
        let registry = self.poll.registry();
        let reaped = self.registry.reap(|conn_id, stream| {
            if let Err(e) = registry.deregister(stream) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
        });

        if reaped > 0 {
            self.stats.reaped.fetch_add(reaped as u64, Ordering::Relaxed);
            self.stats.live.store(self.registry.len(), Ordering::Relaxed);
        }
    }

    fn shutdown(&mut self) {
        info!(live = self.registry.len(), "Dispatch loop stopping");

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Listener deregister failed");
        }

        // Finishes every in-flight job, so every socket is free afterwards.
        self.pool.shutdown();

        let registry = self.poll.registry();
        self.registry.drain(|conn_id, stream| {
            if let Err(e) = registry.deregister(stream) {
                debug!(conn_id, error = %e, "Deregister failed");
            }
        });
        self.stats.live.store(0, Ordering::Relaxed);

        info!(
            accepted = self.stats.accepted.load(Ordering::Relaxed),
            dispatched = self.stats.dispatched.load(Ordering::Relaxed),
            reaped = self.stats.reaped.load(Ordering::Relaxed),
            faults = self.stats.faults.load(Ordering::Relaxed),
            "Dispatch loop stopped"
        );
    }
}
