//! Per-tick coalescing of outbound payloads into as few frames as possible.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::TransportError;
use crate::framing::SUB_MESSAGE_PREFIX;
use crate::pool::{BlockPool, PooledBuffer};

/// Destination for batched frames.
pub trait FrameSink {
    /// Send one frame carrying `sub_messages` in order.
    fn send_frame<B: AsRef<[u8]>>(&mut self, sub_messages: &[B]) -> Result<(), TransportError>;
}

impl FrameSink for Connection {
    fn send_frame<B: AsRef<[u8]>>(&mut self, sub_messages: &[B]) -> Result<(), TransportError> {
        Connection::send_frame(self, sub_messages)
    }
}

/// Collects payloads during a tick and emits them as frames on [`flush`](Self::flush).
///
/// Payloads are copied into pooled buffers on enqueue. A flush splits the
/// queue greedily: each frame takes payloads in order until the next one
/// would push its body past `max_body`.
pub struct OutboundBatcher {
    pool: Arc<BlockPool>,
    max_body: usize,
    queue: Vec<PooledBuffer>,
    queued_bytes: usize,
}

impl OutboundBatcher {
    /// Create an empty batcher whose frames stay within `max_body` body bytes.
    pub fn new(pool: Arc<BlockPool>, max_body: usize) -> Self {
        Self {
            pool,
            max_body,
            queue: Vec::new(),
            queued_bytes: 0,
        }
    }

    /// Maximum frame body produced by [`flush`](Self::flush).
    pub fn max_body(&self) -> usize {
        self.max_body
    }

    /// Number of queued payloads.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Payload bytes queued, excluding length prefixes.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Queue a copy of `payload` for the next flush.
    ///
    /// Fails with [`TransportError::PayloadTooLarge`] if the payload and its
    /// length prefix could never fit one frame body.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let cost = SUB_MESSAGE_PREFIX + payload.len();
        if cost > self.max_body {
            return Err(TransportError::PayloadTooLarge {
                size: cost,
                max: self.max_body,
            });
        }

        let mut buffer = self.pool.acquire(payload.len());
        buffer.copy_from(payload);
        self.queue.push(buffer);
        self.queued_bytes += payload.len();
        Ok(())
    }

    /// Send everything queued through `sink`, returning the number of frames.
    ///
    /// The queue is emptied and its buffers recycled even when a send fails;
    /// the first error is returned after the remaining runs are abandoned.
    pub fn flush<S: FrameSink>(&mut self, sink: &mut S) -> Result<usize, TransportError> {
        let result = self.send_runs(sink);
        self.clear();
        result
    }

    fn send_runs<S: FrameSink>(&self, sink: &mut S) -> Result<usize, TransportError> {
        let mut frames = 0;
        let mut start = 0;
        let mut body = 0;

        for (i, payload) in self.queue.iter().enumerate() {
            let cost = SUB_MESSAGE_PREFIX + payload.len();
            if body + cost > self.max_body && i > start {
                sink.send_frame(&self.queue[start..i])?;
                frames += 1;
                start = i;
                body = 0;
            }
            body += cost;
        }

        if start < self.queue.len() {
            sink.send_frame(&self.queue[start..])?;
            frames += 1;
        }
        Ok(frames)
    }

    /// Drop every queued payload, recycling its buffer.
    pub fn clear(&mut self) {
        for buffer in self.queue.drain(..) {
            self.pool.release(buffer);
        }
        self.queued_bytes = 0;
    }
}

impl Drop for OutboundBatcher {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{DEFAULT_MAX_FRAME_BODY, batch_body_len};

    /// Records the sub-message sizes of every frame it is handed.
    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<Vec<Vec<u8>>>,
        fail_on: Option<usize>,
    }

    impl FrameSink for RecordingSink {
        fn send_frame<B: AsRef<[u8]>>(
            &mut self,
            sub_messages: &[B],
        ) -> Result<(), TransportError> {
            if self.fail_on == Some(self.frames.len()) {
                return Err(TransportError::SendBufferFull);
            }
            self.frames
                .push(sub_messages.iter().map(|m| m.as_ref().to_vec()).collect());
            Ok(())
        }
    }

    fn batcher(max_body: usize) -> OutboundBatcher {
        OutboundBatcher::new(Arc::new(BlockPool::default()), max_body)
    }

    fn frame_sizes(sink: &RecordingSink) -> Vec<Vec<usize>> {
        sink.frames
            .iter()
            .map(|f| f.iter().map(Vec::len).collect())
            .collect()
    }

    #[test]
    fn test_three_large_payloads_need_three_frames() {
        let mut batcher = batcher(DEFAULT_MAX_FRAME_BODY);
        for _ in 0..3 {
            batcher.enqueue(&[1u8; 1000]).unwrap();
        }
        let mut sink = RecordingSink::default();
        assert_eq!(batcher.flush(&mut sink).unwrap(), 3);
        assert_eq!(frame_sizes(&sink), vec![vec![1000], vec![1000], vec![1000]]);
    }

    #[test]
    fn test_small_payloads_share_a_frame() {
        let mut batcher = batcher(DEFAULT_MAX_FRAME_BODY);
        for i in 0..10u8 {
            batcher.enqueue(&[i; 20]).unwrap();
        }
        let mut sink = RecordingSink::default();
        assert_eq!(batcher.flush(&mut sink).unwrap(), 1);
        assert_eq!(sink.frames[0].len(), 10);
        assert_eq!(sink.frames[0][3], vec![3u8; 20]);
    }

    #[test]
    fn test_runs_split_before_overflow() {
        // 2+4 + 2+4 = 12 fits, a third would make 18 > 16
        let mut batcher = batcher(16);
        for _ in 0..5 {
            batcher.enqueue(b"abcd").unwrap();
        }
        let mut sink = RecordingSink::default();
        assert_eq!(batcher.flush(&mut sink).unwrap(), 3);
        assert_eq!(frame_sizes(&sink), vec![vec![4, 4], vec![4, 4], vec![4]]);
        for frame in &sink.frames {
            assert!(batch_body_len(frame) <= 16);
        }
    }

    #[test]
    fn test_exact_fit_stays_in_one_frame() {
        let mut batcher = batcher(12);
        batcher.enqueue(b"abcd").unwrap();
        batcher.enqueue(b"efgh").unwrap();
        let mut sink = RecordingSink::default();
        assert_eq!(batcher.flush(&mut sink).unwrap(), 1);
    }

    #[test]
    fn test_order_is_preserved_across_frames() {
        let mut batcher = batcher(64);
        let payloads: Vec<Vec<u8>> = (0..30u8).map(|i| vec![i; (i as usize % 7) + 1]).collect();
        for p in &payloads {
            batcher.enqueue(p).unwrap();
        }
        let mut sink = RecordingSink::default();
        batcher.flush(&mut sink).unwrap();
        let flattened: Vec<Vec<u8>> = sink.frames.into_iter().flatten().collect();
        assert_eq!(flattened, payloads);
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let mut batcher = batcher(64);
        let mut sink = RecordingSink::default();
        assert_eq!(batcher.flush(&mut sink).unwrap(), 0);
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut batcher = batcher(DEFAULT_MAX_FRAME_BODY);
        let payload = vec![0u8; DEFAULT_MAX_FRAME_BODY - 1];
        assert!(matches!(
            batcher.enqueue(&payload),
            Err(TransportError::PayloadTooLarge {
                size: 1450,
                max: 1449
            })
        ));
        assert!(batcher.is_empty());
        batcher
            .enqueue(&payload[..DEFAULT_MAX_FRAME_BODY - 2])
            .unwrap();
    }

    #[test]
    fn test_flush_clears_queue_and_recycles_buffers() {
        let pool = Arc::new(BlockPool::default());
        let mut batcher = OutboundBatcher::new(Arc::clone(&pool), 64);
        batcher.enqueue(b"one").unwrap();
        batcher.enqueue(b"two").unwrap();
        assert_eq!(batcher.queued_bytes(), 6);

        let mut sink = RecordingSink::default();
        batcher.flush(&mut sink).unwrap();
        assert!(batcher.is_empty());
        assert_eq!(batcher.queued_bytes(), 0);
        assert_eq!(pool.cached_blocks(), 2);
    }

    #[test]
    fn test_failed_send_still_empties_queue() {
        let pool = Arc::new(BlockPool::default());
        let mut batcher = OutboundBatcher::new(Arc::clone(&pool), 16);
        for _ in 0..5 {
            batcher.enqueue(b"abcd").unwrap();
        }
        let mut sink = RecordingSink {
            fail_on: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            batcher.flush(&mut sink),
            Err(TransportError::SendBufferFull)
        ));
        assert_eq!(sink.frames.len(), 1);
        assert!(batcher.is_empty());
        assert_eq!(pool.cached_blocks(), 5);
    }
}
