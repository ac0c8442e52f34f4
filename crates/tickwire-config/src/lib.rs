//! Configuration system for tickwire clients.
//!
//! Runtime-configurable transport settings persisted to disk as RON files,
//! with CLI overrides via clap, hot-reload detection, and forward/backward
//! compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, DebugConfig, NetworkConfig, PoolConfig, TransportConfig,
};
pub use error::ConfigError;
