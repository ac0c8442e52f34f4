//! Transport throughput counters, sampled once per second for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ---------------------------------------------------------------------------
// TransportCounters
// ---------------------------------------------------------------------------

/// Live counters bumped by the caller thread and both connection workers.
///
/// Atomics only, so the workers never take a lock to record traffic.
#[derive(Debug, Default)]
pub struct TransportCounters {
    /// Bytes written to the socket by the sender thread.
    pub bytes_sent: AtomicU64,
    /// Bytes read from the socket by the receiver thread.
    pub bytes_received: AtomicU64,
    /// Frames pushed into the send buffer.
    pub frames_sent: AtomicU64,
    /// Frames decoded from the receive buffer.
    pub frames_received: AtomicU64,
    /// Sub-messages carried by sent frames.
    pub messages_sent: AtomicU64,
    /// Sub-messages delivered to the inbound handler.
    pub messages_received: AtomicU64,
}

impl TransportCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes leaving through the socket.
    pub fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record bytes arriving from the socket.
    pub fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one outgoing frame carrying `messages` sub-messages.
    pub fn record_frame_sent(&self, messages: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.messages_sent
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Record one decoded frame that delivered `messages` sub-messages.
    pub fn record_frame_received(&self, messages: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.messages_received
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Snapshot and reset all counters (swap with 0).
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            frames_sent: self.frames_sent.swap(0, Ordering::Relaxed),
            frames_received: self.frames_received.swap(0, Ordering::Relaxed),
            messages_sent: self.messages_sent.swap(0, Ordering::Relaxed),
            messages_received: self.messages_received.swap(0, Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// StatsSnapshot
// ---------------------------------------------------------------------------

/// Counter values for one measurement period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Socket bytes sent.
    pub bytes_sent: u64,
    /// Socket bytes received.
    pub bytes_received: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Sub-messages sent.
    pub messages_sent: u64,
    /// Sub-messages received.
    pub messages_received: u64,
}

impl StatsSnapshot {
    /// Average sub-messages per sent frame; zero when nothing was sent.
    pub fn batching_ratio(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            self.messages_sent as f64 / self.frames_sent as f64
        }
    }
}

// ---------------------------------------------------------------------------
// TransportStats
// ---------------------------------------------------------------------------

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// Latest per-second transport statistics.
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// Stats for the most recently completed period.
    pub current: StatsSnapshot,
    /// Bandwidth warning threshold in bytes/second. Default: 10 MB/s.
    pub warning_threshold: u64,
    elapsed: Duration,
}

impl Default for TransportStats {
    fn default() -> Self {
        Self {
            current: StatsSnapshot::default(),
            warning_threshold: 10 * 1024 * 1024,
            elapsed: Duration::ZERO,
        }
    }
}

impl TransportStats {
    /// Accumulate `delta` of tick time; once a full second has passed,
    /// snapshot `counters` into [`current`](Self::current).
    ///
    /// Returns `true` when a new snapshot was taken.
    pub fn update(&mut self, counters: &TransportCounters, delta: Duration) -> bool {
        self.elapsed += delta;
        if self.elapsed < SAMPLE_PERIOD {
            return false;
        }
        self.elapsed = Duration::ZERO;
        self.current = counters.snapshot_and_reset();

        let total_bytes = self.current.bytes_sent + self.current.bytes_received;
        if total_bytes > self.warning_threshold {
            tracing::warn!(
                "Bandwidth threshold exceeded: {} bytes/s (threshold: {} bytes/s)",
                total_bytes,
                self.warning_threshold
            );
        }

        tracing::debug!(
            "Transport: sent={} bytes ({} frames, {} msgs), recv={} bytes ({} frames, {} msgs), batching={:.1} msgs/frame",
            self.current.bytes_sent,
            self.current.frames_sent,
            self.current.messages_sent,
            self.current.bytes_received,
            self.current.frames_received,
            self.current.messages_received,
            self.current.batching_ratio()
        );
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
