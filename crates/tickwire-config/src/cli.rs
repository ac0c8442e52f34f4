//! Command-line argument parsing for tickwire clients.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Client command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tickwire", about = "tickwire TCP game client")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Connect timeout in milliseconds.
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Tick rate of the update loop (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Maximum frame body size in bytes.
    #[arg(long)]
    pub max_frame_body: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Stop after this many ticks.
    #[arg(long)]
    pub ticks: Option<u64>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(timeout) = args.connect_timeout_ms {
            self.network.connect_timeout_ms = timeout;
        }
        if let Some(rate) = args.tick_rate {
            self.network.net_tick_rate = rate;
        }
        if let Some(body) = args.max_frame_body {
            self.transport.max_frame_body = body;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1".to_string()),
            max_frame_body: Some(512),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "192.168.1.1");
        assert_eq!(config.transport.max_frame_body, 512);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.server_port, 8080);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "tickwire",
            "--server",
            "example.org",
            "--port",
            "7000",
            "--ticks",
            "10",
        ]);
        assert_eq!(args.server.as_deref(), Some("example.org"));
        assert_eq!(args.port, Some(7000));
        assert_eq!(args.ticks, Some(10));
        assert!(args.config.is_none());
    }
}
