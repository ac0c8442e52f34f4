//! Caller-facing network client: one connection plus its outbound batcher.

use std::sync::Arc;
use std::time::Duration;

use tickwire_config::Config;

use crate::batcher::OutboundBatcher;
use crate::connection::{Connection, ConnectionState};
use crate::error::TransportError;
use crate::pool::BlockPool;
use crate::stats::TransportStats;

/// Game-loop facing client.
///
/// Typical use, once per tick:
///
/// ```no_run
/// # use std::time::Duration;
/// # use tickwire_config::Config;
/// # use tickwire_net::NetworkClient;
/// # fn main() -> Result<(), tickwire_net::TransportError> {
/// let config = Config::default();
/// let mut client = NetworkClient::new(&config);
/// client.set_inbound_handler(|msg| println!("{} bytes", msg.len()));
/// client.connect("127.0.0.1", 8080, Duration::from_secs(5))?;
///
/// loop {
///     client.tick(Duration::from_millis(33));
///     client.poll_inbound();
///     client.enqueue(b"input")?;
///     client.flush()?;
/// #   break;
/// }
/// # Ok(())
/// # }
/// ```
pub struct NetworkClient {
    connection: Connection,
    batcher: OutboundBatcher,
    stats: TransportStats,
}

impl NetworkClient {
    /// Create a client with its own block pool.
    pub fn new(config: &Config) -> Self {
        Self::with_pool(config, Arc::new(BlockPool::new(&config.pool)))
    }

    /// Create a client drawing buffers from a shared pool.
    pub fn with_pool(config: &Config, pool: Arc<BlockPool>) -> Self {
        Self {
            connection: Connection::new(&config.transport, Arc::clone(&pool)),
            batcher: OutboundBatcher::new(pool, config.transport.max_frame_body),
            stats: TransportStats::default(),
        }
    }

    /// Start connecting in the background; see [`Connection::connect`].
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.connection.connect(host, port, timeout)
    }

    /// Start connecting and fire `on_connected` once the session is up.
    pub fn connect_with_callback(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_connected: impl FnOnce() + Send + 'static,
    ) -> Result<(), TransportError> {
        self.connection
            .connect_with_callback(host, port, timeout, on_connected)
    }

    /// Queue a payload for the end-of-tick flush.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.batcher.enqueue(payload)
    }

    /// Batch every queued payload into frames and hand them to the
    /// connection. Returns the number of frames produced.
    pub fn flush(&mut self) -> Result<usize, TransportError> {
        if self.batcher.is_empty() {
            return Ok(0);
        }
        self.batcher.flush(&mut self.connection)
    }

    /// Queue a control frame immediately, bypassing the batcher.
    pub fn send_command(&mut self, command: u16, body: &[u8]) -> Result<(), TransportError> {
        self.connection.send_command(command, body)
    }

    /// Dispatch buffered inbound frames; see [`Connection::poll_inbound`].
    pub fn poll_inbound(&mut self) -> usize {
        self.connection.poll_inbound()
    }

    /// Register the per-sub-message inbound handler.
    pub fn set_inbound_handler(&mut self, handler: impl FnMut(&[u8]) + Send + 'static) {
        self.connection.set_inbound_handler(handler);
    }

    /// Register the control-frame handler.
    pub fn set_command_handler(&mut self, handler: impl FnMut(u16, &[u8]) + Send + 'static) {
        self.connection.set_command_handler(handler);
    }

    /// Advance the connection and fold `delta` into the per-second stats.
    pub fn tick(&mut self, delta: Duration) {
        self.connection.tick();
        self.stats.update(self.connection.counters(), delta);
    }

    /// Close the connection and drop anything still queued.
    pub fn disconnect(&mut self) {
        self.batcher.clear();
        self.connection.disconnect();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Statistics for the last completed second.
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Payloads waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.batcher.len()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}
