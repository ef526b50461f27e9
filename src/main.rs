//! chat-server binary: serve until SIGINT/SIGTERM, then drain and exit.

use chat_server::{Config, Server};
use std::process::ExitCode;
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_threads = config.max_threads,
        poll_timeout_ms = config.poll_timeout_ms,
        max_fail_count = config.max_fail_count,
        idle_timeout_secs = config.idle_timeout_secs,
        "Starting chat server"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new(&config)?;
    server.start()?;

    #[cfg(unix)]
    let signals = chat_server::SignalWatch::spawn(server.stop_handle())?;

    while !server.is_finished() {
        thread::sleep(config.poll_timeout());
    }
    server.stop();

    #[cfg(unix)]
    let by_signal = signals.received();
    #[cfg(not(unix))]
    let by_signal = false;

    if by_signal {
        Ok(())
    } else {
        Err("dispatch loop exited unexpectedly".into())
    }
}
