//! Stop a server when the process receives SIGINT or SIGTERM.
//!
//! A dedicated thread waits on the signals and forwards the first one to a
//! [`StopHandle`]. The dispatch loop sees the stop within one poll timeout.

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

use crate::server::StopHandle;

pub struct SignalWatch {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
    received: Arc<AtomicBool>,
}

impl SignalWatch {
    /// Start watching; `stop` is triggered on the first signal.
    pub fn spawn(stop: StopHandle) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let received = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&received);
        let thread = thread::Builder::new()
            .name("chat-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    on_signal(signal, &stop, &flag);
                }
                debug!("Signal watch closed");
            });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                handle.close();
                return Err(e);
            }
        };

        Ok(Self {
            handle,
            thread: Some(thread),
            received,
        })
    }

    /// Whether a shutdown signal has arrived.
    pub fn received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn on_signal(signal: i32, stop: &StopHandle, received: &AtomicBool) {
    info!(signal, "Shutdown signal received");
    received.store(true, Ordering::SeqCst);
    stop.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::ServerState;
    use crate::server::Server;
    use std::time::{Duration, Instant};

    fn running_server() -> Server {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            max_threads: 2,
            poll_timeout_ms: 20,
            ..Config::default()
        };
        let mut server = Server::new(&config).unwrap();
        server.start().unwrap();
        server
    }

    fn wait_until_finished(server: &Server) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.is_finished() {
            assert!(Instant::now() < deadline, "dispatch thread did not exit");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_signal_stops_server() {
        let mut server = running_server();
        let received = AtomicBool::new(false);

        on_signal(SIGTERM, &server.stop_handle(), &received);

        assert!(received.load(Ordering::SeqCst));
        wait_until_finished(&server);
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_raised_sigterm_reaches_server() {
        let mut server = running_server();
        let watch = SignalWatch::spawn(server.stop_handle()).unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();

        wait_until_finished(&server);
        assert!(watch.received());
        drop(watch);
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_drop_joins_watch_thread() {
        let server = running_server();
        let watch = SignalWatch::spawn(server.stop_handle()).unwrap();
        // Returns only once the watch thread has exited.
        drop(watch);
    }
}
