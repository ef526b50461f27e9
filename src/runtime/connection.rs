//! Client connections and the live-connection registry.
//!
//! Field ownership is split between the dispatch thread and whichever worker
//! currently holds the connection:
//!
//! - `busy` is set by the dispatch thread when it hands the connection to the
//!   pool and cleared by the worker when the job ends, on every exit path.
//! - `fail_count` and `connected` are written by the worker and read by the
//!   dispatch thread to classify zombies.
//! - `pending` is set by a worker that stopped reading at its byte budget with
//!   input still on the socket. The dispatch thread treats it as readiness,
//!   since the socket will not report that data again.
//! - `last_activity` is written by the worker and may be read concurrently by
//!   the dispatch thread, so it has its own lock.
//! - The socket and inbound buffer belong to the busy holder. They sit behind
//!   a mutex only so ownership can move between threads; the dispatch thread
//!   touches them (with `try_lock`) solely to deregister an idle zombie.
//!
//! The registry is owned by the dispatch thread. A connection leaves it only
//! when it is a zombie and not busy.

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::handler::RequestHandler;
use crate::protocol::serializer::TAG_SIZE;
use crate::protocol::stream::LENGTH_PREFIX_SIZE;
use crate::protocol::Serializer;

/// Size of the stack buffer used for each socket read.
const READ_CHUNK: usize = 4096;

/// Bytes a frame adds around its largest field.
const FRAME_OVERHEAD: usize = TAG_SIZE + LENGTH_PREFIX_SIZE;

/// Pause between write attempts on a socket that would block.
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A byte stream a connection can be served over.
pub trait Transport: Read + Write + Send + 'static {}

impl<T: Read + Write + Send + 'static> Transport for T {}

/// Per-connection limits that decide when a connection is dead.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// A connection whose fail count exceeds this is a zombie.
    pub max_fail_count: u32,
    /// A connection idle for longer than this is a zombie.
    pub idle_timeout: Option<Duration>,
    /// How long a worker keeps retrying a write the socket refuses.
    pub write_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_fail_count: 3,
            idle_timeout: None,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a read pass over the socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    WouldBlock,
    Eof,
    /// The inbound buffer reached the job's byte budget.
    Budget,
}

struct SessionIo<T> {
    stream: T,
    inbound: BytesMut,
}

/// A single client connection.
pub struct Connection<T> {
    id: usize,
    peer: SocketAddr,
    io: Mutex<SessionIo<T>>,
    busy: AtomicBool,
    pending: AtomicBool,
    connected: AtomicBool,
    fail_count: AtomicU32,
    last_activity: Mutex<Instant>,
    limits: SessionLimits,
}

/// Clears the busy flag when a handling job ends, however it ends.
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    fail_count: &'a AtomicU32,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.fail_count.fetch_add(1, Ordering::AcqRel);
        }
        self.busy.store(false, Ordering::Release);
    }
}

impl<T: Transport> Connection<T> {
    pub fn new(id: usize, peer: SocketAddr, stream: T, limits: SessionLimits) -> Self {
        Self {
            id,
            peer,
            io: Mutex::new(SessionIo {
                stream,
                inbound: BytesMut::with_capacity(READ_CHUNK),
            }),
            busy: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            fail_count: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            limits,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether a worker currently owns this connection.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Mark the connection busy. Returns `false` if it already was.
    ///
    /// Only the dispatch thread calls this, before submitting the job, so
    /// repeated readiness for the same socket cannot queue a second job.
    pub fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a claim whose job was never submitted.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Whether the last job left unread input on the socket.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Whether the connection is dead and should be reaped once idle.
    pub fn is_zombie(&self) -> bool {
        if !self.is_connected() || self.fail_count() > self.limits.max_fail_count {
            return true;
        }
        match self.limits.idle_timeout {
            Some(timeout) => self.last_activity().elapsed() > timeout,
            None => false,
        }
    }

    /// Run `f` against the socket if no worker holds it.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut io = self.io.try_lock()?;
        Some(f(&mut io.stream))
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn record_failure(&self) -> u32 {
        self.fail_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Serve whatever the socket has buffered.
    ///
    /// Reads until the socket would block or one maximum-size frame is
    /// buffered, then answers every complete request frame in order. An
    /// incomplete trailing frame stays buffered for the next job. Returns
    /// `true` when reading stopped at the budget, so more input is waiting and
    /// the connection must be scheduled again. The busy flag is cleared when
    /// this returns or unwinds.
    pub fn handle<H>(&self, handler: &H, serializer: &Serializer) -> bool
    where
        H: RequestHandler + ?Sized,
    {
        let _busy = BusyGuard {
            busy: &self.busy,
            fail_count: &self.fail_count,
        };
        self.pending.store(false, Ordering::Release);
        let mut io = self.io.lock();

        let budget = serializer.max_field_len().saturating_add(FRAME_OVERHEAD);
        let end = match self.fill_inbound(&mut io, budget) {
            Ok(end) => end,
            Err(e) => {
                let fails = self.record_failure();
                warn!(conn_id = self.id, peer = %self.peer, fails, error = %e, "Read failed");
                return false;
            }
        };

        loop {
            let (request, consumed) = match serializer.try_decode_request(&io.inbound) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    io.inbound.clear();
                    let fails = self.record_failure();
                    warn!(conn_id = self.id, peer = %self.peer, fails, error = %e, "Decode failed");
                    return false;
                }
            };
            io.inbound.advance(consumed);
            trace!(conn_id = self.id, request = ?request.request_type(), "Handling request");

            let response = handler.handle(request);
            let frame = serializer.encode_response(&response);

            if let Err(e) = self.write_frame(&mut io.stream, &frame) {
                let fails = self.record_failure();
                warn!(conn_id = self.id, peer = %self.peer, fails, error = %e, "Write failed");
                return false;
            }
            self.touch();
        }

        match end {
            ReadEnd::Eof => {
                debug!(conn_id = self.id, peer = %self.peer, "Peer disconnected");
                self.mark_disconnected();
                false
            }
            ReadEnd::Budget => {
                trace!(conn_id = self.id, buffered = io.inbound.len(), "Read budget reached");
                self.pending.store(true, Ordering::Release);
                true
            }
            ReadEnd::WouldBlock => false,
        }
    }

    /// Read until the socket would block, the peer closes, or `budget` bytes
    /// are buffered.
    fn fill_inbound(&self, io: &mut SessionIo<T>, budget: usize) -> io::Result<ReadEnd> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        let end = loop {
            if io.inbound.len() >= budget {
                break ReadEnd::Budget;
            }
            match io.stream.read(&mut chunk) {
                Ok(0) => break ReadEnd::Eof,
                Ok(n) => {
                    io.inbound.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break ReadEnd::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if is_disconnect(&e) {
                        self.mark_disconnected();
                    }
                    return Err(e);
                }
            }
        };

        if total > 0 {
            self.touch();
        }
        trace!(conn_id = self.id, bytes = total, end = ?end, "Read from socket");
        Ok(end)
    }

    fn write_frame(&self, stream: &mut T, frame: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + self.limits.write_timeout;
        let mut written = 0;

        while written < frame.len() {
            match stream.write(&frame[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer stopped accepting data",
                        ));
                    }
                    thread::sleep(WRITE_RETRY_INTERVAL);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if is_disconnect(&e) {
                        self.mark_disconnected();
                    }
                    return Err(e);
                }
            }
        }

        stream.flush()
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

struct Entry<T> {
    conn: Arc<Connection<T>>,
    /// Readiness seen but not yet dispatched.
    ready: bool,
}

/// Live connections, keyed by the id used as their poll token.
///
/// Owned and mutated only by the dispatch thread.
pub struct ConnectionRegistry<T> {
    connections: Slab<Entry<T>>,
    max_connections: usize,
}

impl<T: Transport> ConnectionRegistry<T> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Id the next inserted connection will get, or `None` at capacity.
    pub fn next_id(&self) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.vacant_key())
    }

    /// Insert a connection built with the id from [`next_id`](Self::next_id).
    pub fn insert(&mut self, conn: Connection<T>) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        debug_assert_eq!(conn.id(), self.connections.vacant_key());
        Some(self.connections.insert(Entry {
            conn: Arc::new(conn),
            ready: false,
        }))
    }

    pub fn get(&self, id: usize) -> Option<&Arc<Connection<T>>> {
        self.connections.get(id).map(|entry| &entry.conn)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Record that the socket for `id` reported readiness.
    pub fn mark_ready(&mut self, id: usize) {
        if let Some(entry) = self.connections.get_mut(id) {
            entry.ready = true;
        }
    }

    /// Hand every ready, idle, live connection to `submit`.
    ///
    /// A connection whose last job left input unread counts as ready. Busy
    /// connections keep their readiness until a later call. A zombie's
    /// readiness is dropped. If `submit` returns `false` the claim is undone.
    /// Returns the number of connections submitted.
    pub fn dispatch_ready<F>(&mut self, mut submit: F) -> usize
    where
        F: FnMut(Arc<Connection<T>>) -> bool,
    {
        let mut submitted = 0;
        for (_, entry) in self.connections.iter_mut() {
            if !entry.ready && !entry.conn.has_pending() {
                continue;
            }
            if entry.conn.is_zombie() {
                entry.ready = false;
                continue;
            }
            if !entry.conn.try_claim() {
                continue;
            }
            entry.ready = false;
            if submit(Arc::clone(&entry.conn)) {
                submitted += 1;
            } else {
                entry.conn.release();
            }
        }
        submitted
    }

    /// Remove every zombie that no worker holds.
    ///
    /// `release` runs against each removed connection's socket before the
    /// connection leaves the registry. Returns the number removed.
    pub fn reap<F>(&mut self, mut release: F) -> usize
    where
        F: FnMut(usize, &mut T),
    {
        let doomed: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, entry)| entry.conn.is_zombie() && !entry.conn.is_busy())
            .map(|(id, _)| id)
            .collect();

        let mut reaped = 0;
        for id in doomed {
            let entry = &self.connections[id];
            if entry.conn.with_transport(|stream| release(id, stream)).is_none() {
                // Still held by a worker finishing up; retry next sweep.
                continue;
            }
            let entry = self.connections.remove(id);
            debug!(
                conn_id = id,
                peer = %entry.conn.peer(),
                fails = entry.conn.fail_count(),
                "Connection reaped"
            );
            reaped += 1;
        }
        reaped
    }

    /// Remove every connection, releasing each socket that is free.
    pub fn drain<F>(&mut self, mut release: F)
    where
        F: FnMut(usize, &mut T),
    {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            let entry = self.connections.remove(id);
            let _ = entry.conn.with_transport(|stream| release(id, stream));
        }
    }
}
