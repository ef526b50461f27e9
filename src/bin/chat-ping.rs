//! chat-ping: connect, send one ping, report the round trip.

use chat_server::Client;
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-ping")]
#[command(version = "0.1.0")]
#[command(about = "Send one ping to a chat server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 25565)]
    port: u16,

    /// Payload echoed back by the server
    #[arg(short, long, default_value = "")]
    message: String,

    /// Read/write timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = Client::connect((args.host.as_str(), args.port)).and_then(|mut client| {
        client.set_timeout(Some(Duration::from_millis(args.timeout_ms)))?;
        client.ping(&args.message)
    });

    match result {
        Ok(reply) => {
            info!(
                host = %args.host,
                port = args.port,
                round_trip_ms = reply.round_trip.as_secs_f64() * 1000.0,
                message = %reply.message,
                "Ping"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(host = %args.host, port = args.port, error = %e, "Ping failed");
            ExitCode::FAILURE
        }
    }
}
