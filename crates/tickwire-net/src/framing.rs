//! Frame layout shared with the game server.
//!
//! Every frame on the TCP stream is an 11-byte header followed by a body:
//!
//! ```text
//! +--------+-------------+-----------+--------------+
//! | marker | body length | command   | sequence     |
//! | u8 2E  | u32 BE      | u16 BE    | u32 BE       |
//! +--------+-------------+-----------+--------------+
//! | body: (sub_len u16 BE, sub_payload)*            |
//! +-------------------------------------------------+
//! ```
//!
//! Command 0 marks an ordinary batch whose body is a back-to-back run of
//! length-prefixed sub-messages. Any other command is a control frame; its
//! body is opaque to the transport and handed to the command handler whole.
//!
//! Sequence numbers are counted per direction, starting at 1.

use std::ops::Range;
use std::sync::Arc;

use crate::pool::{BlockPool, PooledBuffer};
use crate::ring::Consumer;

/// First byte of every frame header.
pub const FRAME_MARKER: u8 = 0x2E;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 11;

/// Size of the length prefix in front of each sub-message.
pub const SUB_MESSAGE_PREFIX: usize = 2;

/// Command id of an ordinary sub-message batch.
pub const COMMAND_BATCH: u16 = 0;

/// Transport segment size the default frame ceiling is derived from.
pub const DEFAULT_SEGMENT_SIZE: usize = 1460;

/// Largest body that keeps a frame inside one default transport segment.
pub const DEFAULT_MAX_FRAME_BODY: usize = DEFAULT_SEGMENT_SIZE - HEADER_SIZE;

/// Largest single sub-message payload.
pub const MAX_SUB_MESSAGE: usize = u16::MAX as usize;

/// Errors raised while building or parsing frames.
///
/// Every decode-side variant means the byte stream can no longer be trusted;
/// the connection is closed rather than resynchronised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The header did not start with [`FRAME_MARKER`].
    #[error("bad frame marker 0x{found:02x}, expected 0x2e")]
    BadMarker {
        /// The byte found where the marker should be.
        found: u8,
    },

    /// Fewer bytes than a header were supplied.
    #[error("truncated frame header: {available} of 11 bytes")]
    Truncated {
        /// Bytes available.
        available: usize,
    },

    /// A sub-message declared more bytes than remain in the body.
    #[error("sub-message at offset {offset} declares {declared} bytes but only {remaining} remain")]
    SubMessageOverrun {
        /// Offset of the length prefix within the body.
        offset: usize,
        /// Declared payload length.
        declared: usize,
        /// Bytes left in the body after the prefix.
        remaining: usize,
    },

    /// A sub-message payload does not fit its 16-bit length prefix.
    #[error("sub-message of {size} bytes exceeds 65535")]
    SubMessageTooLarge {
        /// Payload size.
        size: usize,
    },

    /// A frame body exceeds the allowed maximum.
    #[error("frame body of {size} bytes exceeds maximum {max}")]
    BodyTooLarge {
        /// Body size.
        size: usize,
        /// Configured or representable maximum.
        max: usize,
    },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length in bytes.
    pub body_len: u32,
    /// Command id; [`COMMAND_BATCH`] for ordinary frames.
    pub command: u16,
    /// Per-direction sequence number.
    pub sequence: u32,
}

impl FrameHeader {
    /// Serialize to wire order.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = FRAME_MARKER;
        out[1..5].copy_from_slice(&self.body_len.to_be_bytes());
        out[5..7].copy_from_slice(&self.command.to_be_bytes());
        out[7..11].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Parse the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let Some(raw) = bytes.get(..HEADER_SIZE) else {
            return Err(FrameError::Truncated {
                available: bytes.len(),
            });
        };
        if raw[0] != FRAME_MARKER {
            return Err(FrameError::BadMarker { found: raw[0] });
        }
        Ok(Self {
            body_len: u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]),
            command: u16::from_be_bytes([raw[5], raw[6]]),
            sequence: u32::from_be_bytes([raw[7], raw[8], raw[9], raw[10]]),
        })
    }

    /// Whether this is a control frame rather than a sub-message batch.
    pub fn is_control(&self) -> bool {
        self.command != COMMAND_BATCH
    }

    /// Header plus body size.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len as usize
    }
}

/// Encoded body size of a batch: each payload plus its length prefix.
pub fn batch_body_len<B: AsRef<[u8]>>(sub_messages: &[B]) -> usize {
    sub_messages
        .iter()
        .map(|m| SUB_MESSAGE_PREFIX + m.as_ref().len())
        .sum()
}

/// Builds outbound frames and owns the send-direction sequence counter.
pub struct FrameEncoder {
    pool: Arc<BlockPool>,
    next_sequence: u32,
}

impl FrameEncoder {
    /// Create an encoder whose first frame carries sequence 1.
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self {
            pool,
            next_sequence: 1,
        }
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Encode an ordinary frame carrying `sub_messages` in order.
    ///
    /// The returned buffer comes from the pool; hand it back with
    /// [`BlockPool::release`] once written out.
    pub fn encode_frame<B: AsRef<[u8]>>(
        &mut self,
        sub_messages: &[B],
    ) -> Result<PooledBuffer, FrameError> {
        if let Some(big) = sub_messages
            .iter()
            .map(|m| m.as_ref().len())
            .find(|&len| len > MAX_SUB_MESSAGE)
        {
            return Err(FrameError::SubMessageTooLarge { size: big });
        }

        let body_len = batch_body_len(sub_messages);
        let mut frame = self.start_frame(COMMAND_BATCH, body_len)?;

        let mut offset = HEADER_SIZE;
        for message in sub_messages {
            let message = message.as_ref();
            frame[offset..offset + SUB_MESSAGE_PREFIX]
                .copy_from_slice(&(message.len() as u16).to_be_bytes());
            offset += SUB_MESSAGE_PREFIX;
            frame[offset..offset + message.len()].copy_from_slice(message);
            offset += message.len();
        }
        debug_assert_eq!(offset, frame.len());
        Ok(frame)
    }

    /// Encode a control frame with an opaque body.
    pub fn encode_command(
        &mut self,
        command: u16,
        body: &[u8],
    ) -> Result<PooledBuffer, FrameError> {
        let mut frame = self.start_frame(command, body.len())?;
        frame[HEADER_SIZE..].copy_from_slice(body);
        Ok(frame)
    }

    /// Acquire a frame buffer, write its header and consume a sequence number.
    fn start_frame(
        &mut self,
        command: u16,
        body_len: usize,
    ) -> Result<PooledBuffer, FrameError> {
        let wire_len = u32::try_from(body_len).map_err(|_| FrameError::BodyTooLarge {
            size: body_len,
            max: u32::MAX as usize,
        })?;

        let header = FrameHeader {
            body_len: wire_len,
            command,
            sequence: self.next_sequence,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut frame = self.pool.acquire(HEADER_SIZE + body_len);
        frame[..HEADER_SIZE].copy_from_slice(&header.encode());
        Ok(frame)
    }
}

/// Lazy walk over the sub-messages of a batch body.
///
/// Yields the byte range of each payload within the body, in order. A length
/// prefix that runs past the end of the body yields one error and then ends.
pub struct SubMessages<'a> {
    body: &'a [u8],
    offset: usize,
    failed: bool,
}

/// Iterate the sub-messages of `body`.
pub fn decode_sub_messages(body: &[u8]) -> SubMessages<'_> {
    SubMessages {
        body,
        offset: 0,
        failed: false,
    }
}

impl Iterator for SubMessages<'_> {
    type Item = Result<Range<usize>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.body.len() {
            return None;
        }

        let prefix_at = self.offset;
        let remaining = self.body.len() - prefix_at;
        if remaining < SUB_MESSAGE_PREFIX {
            self.failed = true;
            return Some(Err(FrameError::SubMessageOverrun {
                offset: prefix_at,
                declared: SUB_MESSAGE_PREFIX,
                remaining,
            }));
        }

        let declared =
            u16::from_be_bytes([self.body[prefix_at], self.body[prefix_at + 1]]) as usize;
        let start = prefix_at + SUB_MESSAGE_PREFIX;
        let remaining = self.body.len() - start;
        if declared > remaining {
            self.failed = true;
            return Some(Err(FrameError::SubMessageOverrun {
                offset: prefix_at,
                declared,
                remaining,
            }));
        }

        self.offset = start + declared;
        Some(Ok(start..self.offset))
    }
}

impl std::iter::FusedIterator for SubMessages<'_> {}

/// A complete inbound frame pulled off the receive ring.
#[derive(Debug)]
pub struct InboundFrame {
    /// Parsed header.
    pub header: FrameHeader,
    /// Body bytes, pooled; release after dispatch.
    pub body: PooledBuffer,
}

/// Pulls whole frames off the receive ring and tracks the receive sequence.
pub struct FrameDecoder {
    pool: Arc<BlockPool>,
    max_body: usize,
    expected_sequence: u32,
}

impl FrameDecoder {
    /// Create a decoder accepting bodies up to `max_body` bytes.
    pub fn new(pool: Arc<BlockPool>, max_body: usize) -> Self {
        Self {
            pool,
            max_body,
            expected_sequence: 1,
        }
    }

    /// Sequence number the next inbound frame is expected to carry.
    pub fn expected_sequence(&self) -> u32 {
        self.expected_sequence
    }

    /// Take the next complete frame from `inbound`.
    ///
    /// Returns `Ok(None)` without consuming anything while the header or body
    /// is still incomplete. Errors leave the ring untouched; the caller is
    /// expected to discard the stream.
    pub fn next_frame(
        &mut self,
        inbound: &mut Consumer,
    ) -> Result<Option<InboundFrame>, FrameError> {
        let mut raw = [0u8; HEADER_SIZE];
        if !inbound.try_peek(&mut raw) {
            return Ok(None);
        }

        let header = FrameHeader::decode(&raw)?;
        let body_len = header.body_len as usize;
        if body_len > self.max_body {
            return Err(FrameError::BodyTooLarge {
                size: body_len,
                max: self.max_body,
            });
        }
        if inbound.len() < header.frame_len() {
            return Ok(None);
        }

        let mut body = self.pool.acquire(body_len);
        let consumed = inbound.advance_read(HEADER_SIZE) && inbound.try_read(&mut body);
        assert!(consumed, "receive ring lost bytes between peek and read");

        if header.sequence != self.expected_sequence {
            tracing::warn!(
                expected = self.expected_sequence,
                received = header.sequence,
                "inbound frame sequence gap"
            );
        }
        self.expected_sequence = header.sequence.wrapping_add(1);

        Ok(Some(InboundFrame { header, body }))
    }
}
