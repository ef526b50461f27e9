//! Session runtime.
//!
//! - `Connection`: one client session and its request/response cycle
//! - `ConnectionRegistry`: slab of live sessions keyed by poll token
//! - `WorkerPool`: fixed set of threads running connection cycles
//! - `DispatchLoop`: the readiness loop tying the three together

mod connection;
mod event_loop;
mod pool;

pub use connection::{Connection, ConnectionRegistry, SessionLimits, Transport};
pub use event_loop::{ServerState, MAX_CONNECTIONS};
pub use pool::{PoolError, WorkerPool};

pub(crate) use event_loop::{DispatchLoop, LoopSettings, LoopStats, SharedState};
