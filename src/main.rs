//! respwire: send one command to a RESP server and print the reply.
//!
//! Connection settings come from CLI arguments or a TOML file; the command
//! is whatever follows the options (default `PING`).

use std::process::ExitCode;
use std::time::Duration;

use respwire::config::Config;
use respwire::memory::OutgoingBuffer;
use respwire::{Client, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&config).await {
        Ok(value) => {
            println!("{value}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config) -> Result<Value, Box<dyn std::error::Error>> {
    let options = config.client_options();
    info!(
        address = %options.address,
        protocol = ?options.protocol,
        track_leases = config.track_leases,
        "Connecting"
    );

    let client = Client::connect(options).await?;

    let (name, args) = match config.command.split_first() {
        Some((name, args)) => (name.as_str(), args),
        None => ("PING", &[][..]),
    };
    let command = client.command(name).args(args);

    let result = client.execute::<Value>(command).await;
    client.close().await;

    if client.pool().tracks_leases() {
        OutgoingBuffer::release_staging(client.pool());
        for leak in client.pool().scan_for_leaks(Duration::ZERO) {
            warn!(
                size = leak.size,
                age_ms = leak.age.as_millis() as u64,
                "block still leased after close"
            );
        }
    }
    Ok(result?)
}
