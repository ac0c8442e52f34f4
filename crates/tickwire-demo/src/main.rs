//! Demo client that connects to a game server and exchanges batched messages.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p tickwire-demo -- --server 127.0.0.1 --port 8080`.
//! Add `--ticks 300` to stop after a fixed number of ticks.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use clap::Parser;
use tickwire_config::{CliArgs, Config};
use tickwire_net::{ConnectionState, NetworkClient};
use tracing::{error, info, warn};

/// Command id the demo server uses for its "server notice" control frames.
const NOTICE_COMMAND: u16 = 1;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let Some(config_dir) = args.config.clone().or_else(Config::default_dir) else {
        eprintln!("Failed to resolve config directory, pass --config");
        return ExitCode::FAILURE;
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tickwire_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    run(&config, args.ticks)
}

fn run(config: &Config, max_ticks: Option<u64>) -> ExitCode {
    let mut client = NetworkClient::new(config);

    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    client.set_inbound_handler(move |msg| {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!("inbound #{n}: {}", String::from_utf8_lossy(msg));
    });
    client.set_command_handler(|cmd, body| match cmd {
        NOTICE_COMMAND => info!("server notice: {}", String::from_utf8_lossy(body)),
        other => warn!("unhandled command {other} ({} bytes)", body.len()),
    });

    let network = &config.network;
    info!(
        "Connecting to {}:{} (timeout {:?}, {} Hz)",
        network.server_address,
        network.server_port,
        network.connect_timeout(),
        network.net_tick_rate
    );
    let connect = client.connect_with_callback(
        &network.server_address,
        network.server_port,
        network.connect_timeout(),
        || info!("Connected"),
    );
    if let Err(e) = connect {
        error!("Connect failed: {e}");
        return ExitCode::FAILURE;
    }

    let tick_interval = network.tick_interval();
    let mut last_tick = Instant::now();
    let mut tick: u64 = 0;

    loop {
        let now = Instant::now();
        let delta = now - last_tick;
        last_tick = now;

        client.tick(delta);
        client.poll_inbound();

        match client.state() {
            ConnectionState::Connected => {
                let greeting = format!("hello from tick {tick}");
                if let Err(e) = client.enqueue(greeting.as_bytes()) {
                    warn!("Dropping greeting: {e}");
                }
            }
            ConnectionState::Init | ConnectionState::Connecting => {}
            ended => {
                info!("Connection ended in state {ended}");
                break;
            }
        }

        if let Err(e) = client.flush() {
            warn!("Flush failed: {e}");
        }

        tick += 1;
        if max_ticks.is_some_and(|max| tick >= max) {
            info!("Reached {tick} ticks, disconnecting");
            break;
        }

        if let Some(remaining) = tick_interval.checked_sub(last_tick.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    client.disconnect();
    let stats = client.stats().current;
    info!(
        "Done after {tick} ticks: {} messages received, last second sent {} bytes in {} frames",
        received.load(Ordering::Relaxed),
        stats.bytes_sent,
        stats.frames_sent
    );

    match client.state() {
        ConnectionState::TimedOut | ConnectionState::Error => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    }
}
