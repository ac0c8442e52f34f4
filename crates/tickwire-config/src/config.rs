//! Configuration structs with sensible defaults and RON persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name used inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server endpoint settings.
    pub network: NetworkConfig,
    /// Framing, ring buffer and worker thread settings.
    pub transport: TransportConfig,
    /// Block pool settings.
    pub pool: PoolConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Server endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server host name or IP address.
    pub server_address: String,
    /// Server port.
    pub server_port: u16,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Tick rate of the caller's update loop (Hz).
    pub net_tick_rate: u32,
}

/// Transport configuration: buffer sizes and worker pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of the outbound ring buffer in bytes.
    pub send_buffer_capacity: usize,
    /// Capacity of the inbound ring buffer in bytes.
    pub recv_buffer_capacity: usize,
    /// Largest frame body the batcher will produce (transport segment minus header).
    pub max_frame_body: usize,
    /// Largest single socket write performed by the sender thread.
    pub max_send_chunk: usize,
    /// Size of the receiver thread's scratch buffer.
    pub recv_scratch_size: usize,
    /// Largest frame body accepted from the server.
    pub max_inbound_body: usize,
    /// Maximum number of frames decoded per `poll_inbound` call.
    pub max_frames_per_poll: usize,
    /// Sleep applied by workers and `send` when a ring buffer is empty/full (microseconds).
    pub idle_backoff_us: u64,
    /// Socket read timeout; bounds how long the receiver takes to notice teardown (milliseconds).
    pub recv_timeout_ms: u64,
    /// Disable Nagle's algorithm on the socket.
    pub nodelay: bool,
}

/// Block pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Free blocks kept per size class; releases past this are dropped.
    pub max_cached_per_class: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 8080,
            connect_timeout_ms: 60_000,
            net_tick_rate: 30,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer_capacity: 10 * 1024 * 1024,
            recv_buffer_capacity: 10 * 1024 * 1024,
            max_frame_body: 1460 - 11,
            max_send_chunk: 1460,
            recv_scratch_size: 1460,
            max_inbound_body: u16::MAX as usize,
            max_frames_per_poll: 256,
            idle_backoff_us: 1_000,
            recv_timeout_ms: 250,
            nodelay: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_cached_per_class: 256,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Duration of one caller tick. A zero tick rate falls back to 30 Hz.
    pub fn tick_interval(&self) -> Duration {
        let rate = if self.net_tick_rate == 0 {
            30
        } else {
            self.net_tick_rate
        };
        Duration::from_secs_f64(1.0 / f64::from(rate))
    }
}

impl TransportConfig {
    /// Worker idle backoff as a [`Duration`].
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }

    /// Socket read timeout as a [`Duration`]; `None` when set to zero.
    pub fn recv_timeout(&self) -> Option<Duration> {
        (self.recv_timeout_ms > 0).then(|| Duration::from_millis(self.recv_timeout_ms))
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the transport cannot run with.
    ///
    /// Every frame the batcher builds must fit the outbound ring, every frame the
    /// server may send must fit the inbound ring, and a frame body must leave
    /// room for at least one sub-message length prefix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const HEADER: usize = 11;
        let t = &self.transport;

        if t.max_frame_body < 3 {
            return Err(ConfigError::Invalid {
                field: "transport.max_frame_body",
                reason: format!("{} leaves no room for a sub-message", t.max_frame_body),
            });
        }
        if t.send_buffer_capacity < t.max_frame_body + HEADER {
            return Err(ConfigError::Invalid {
                field: "transport.send_buffer_capacity",
                reason: format!(
                    "{} cannot hold one {}-byte frame",
                    t.send_buffer_capacity,
                    t.max_frame_body + HEADER
                ),
            });
        }
        if t.recv_buffer_capacity < t.max_inbound_body + HEADER {
            return Err(ConfigError::Invalid {
                field: "transport.recv_buffer_capacity",
                reason: format!(
                    "{} cannot hold one {}-byte frame",
                    t.recv_buffer_capacity,
                    t.max_inbound_body + HEADER
                ),
            });
        }
        if t.max_send_chunk == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.max_send_chunk",
                reason: "must be non-zero".to_string(),
            });
        }
        if t.recv_scratch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.recv_scratch_size",
                reason: "must be non-zero".to_string(),
            });
        }
        if t.max_frames_per_poll == 0 {
            return Err(ConfigError::Invalid {
                field: "transport.max_frames_per_poll",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Default per-user config directory (`<config_dir>/tickwire`).
    pub fn default_dir() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tickwire"))
    }
}
