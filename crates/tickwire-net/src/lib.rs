//! Client-side TCP transport for a persistent game session: pooled buffers,
//! SPSC rings between the game loop and the network threads, sub-message
//! framing, a connection state machine, and per-tick outbound batching.

pub mod batcher;
pub mod client;
pub mod connection;
pub mod error;
pub mod framing;
pub mod pool;
pub mod ring;
mod socket;
pub mod stats;

pub use batcher::{FrameSink, OutboundBatcher};
pub use client::NetworkClient;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use error::TransportError;
pub use framing::{
    COMMAND_BATCH, DEFAULT_MAX_FRAME_BODY, FRAME_MARKER, FrameDecoder, FrameEncoder, FrameError,
    FrameHeader, HEADER_SIZE, InboundFrame, SubMessages, decode_sub_messages,
};
pub use pool::{BlockPool, PoolStats, PooledBuffer};
pub use ring::{Consumer, Producer, ring_buffer};
pub use stats::{StatsSnapshot, TransportCounters, TransportStats};
