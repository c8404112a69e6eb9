//! Session traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters updated by the pump loops.
#[derive(Debug)]
pub struct TunnelStats {
    started_at: Instant,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    datagrams_dropped: AtomicU64,
    oversized_frames: AtomicU64,
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStats {
    pub fn new() -> Self {
        TunnelStats {
            started_at: Instant::now(),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            oversized_frames: AtomicU64::new(0),
        }
    }

    /// Record one frame read from the adapter and sent to the peer.
    pub fn record_sent(&self, frame_len: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(frame_len as u64, Ordering::Relaxed);
    }

    /// Record one frame received from the peer and written to the adapter.
    pub fn record_received(&self, frame_len: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(frame_len as u64, Ordering::Relaxed);
    }

    /// Record a datagram that failed to decode or authenticate.
    pub fn record_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an adapter frame that did not fit the read buffer.
    pub fn record_oversized(&self) {
        self.oversized_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            oversized_frames: self.oversized_frames.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

/// Point-in-time copy of [`TunnelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames sent to the peer
    pub frames_sent: u64,
    /// Plaintext bytes sent to the peer
    pub bytes_sent: u64,
    /// Frames written to the adapter
    pub frames_received: u64,
    /// Plaintext bytes written to the adapter
    pub bytes_received: u64,
    /// Inbound datagrams discarded as malformed or unauthenticated
    pub datagrams_dropped: u64,
    /// Adapter frames discarded for exceeding the buffer
    pub oversized_frames: u64,
    /// Time since the session started
    pub uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = TunnelStats::new();
        stats.record_sent(100);
        stats.record_sent(20);
        stats.record_received(7);
        stats.record_dropped();
        stats.record_oversized();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 120);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 7);
        assert_eq!(snap.datagrams_dropped, 1);
        assert_eq!(snap.oversized_frames, 1);
    }
}
