//! Channel statistics: monotonic counters updated from every worker,
//! snapshotted on demand.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of a channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelStats {
    /// DATA frames written for the first time (retransmits excluded).
    pub packets_sent: u64,
    /// Valid DATA frames that arrived (duplicates included).
    pub packets_received: u64,
    /// Windowed frames reissued, whether by RTO, NAK, or duplicate-ACK.
    pub packets_retransmitted: u64,
    /// Frames the codec rejected (bad magic, length, CRC, kind).
    pub packets_invalid: u64,
    /// Payload bytes accepted into first-time DATA frames.
    pub bytes_sent: u64,
    /// Payload bytes delivered to the application in order.
    pub bytes_received: u64,
    /// Retransmission-timer expirations.
    pub timeouts: u64,
    /// Errors surfaced through the error path.
    pub errors: u64,
    /// Smoothed round-trip time, zero until the first sample.
    pub srtt_ms: f64,
    /// Current effective retransmission timeout for fresh frames.
    pub rto_ms: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCells {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub packets_retransmitted: AtomicU64,
    pub packets_invalid: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub errors: AtomicU64,
}

impl StatsCells {
    pub fn add(&self, cell: &AtomicU64, n: u64) {
        cell.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, srtt_ms: f64, rto_ms: u64) -> ChannelStats {
        ChannelStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_retransmitted: self.packets_retransmitted.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            srtt_ms,
            rto_ms,
        }
    }

    pub fn reset(&self) {
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_retransmitted.store(0, Ordering::Relaxed);
        self.packets_invalid.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}
