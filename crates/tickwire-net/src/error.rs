//! Caller-facing transport errors.

use crate::connection::ConnectionState;
use crate::framing::FrameError;

/// Errors returned by [`Connection`](crate::Connection),
/// [`OutboundBatcher`](crate::OutboundBatcher) and
/// [`NetworkClient`](crate::NetworkClient).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Frame encoding failed.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// `connect` was called on a connection that already left `Init`.
    #[error("connect requested in state {0:?}")]
    InvalidState(ConnectionState),

    /// The connection cannot carry frames in its current state.
    #[error("not connected (state {0:?})")]
    NotConnected(ConnectionState),

    /// A single payload can never fit a frame body.
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload size plus its length prefix.
        size: usize,
        /// Maximum frame body.
        max: usize,
    },

    /// An encoded frame is larger than the whole send buffer.
    #[error("frame of {size} bytes exceeds send buffer capacity {capacity}")]
    FrameTooLarge {
        /// Encoded frame size.
        size: usize,
        /// Send ring capacity.
        capacity: usize,
    },

    /// A control frame used the command id reserved for batches.
    #[error("command id {0} is reserved for sub-message batches")]
    InvalidCommand(u16),

    /// The send buffer has no room and the connection is not draining it yet.
    #[error("send buffer full")]
    SendBufferFull,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
