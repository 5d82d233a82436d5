//! Feed counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the run loop and its handle. Level and
/// trade counters track applied mutations, not raw wire events.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub messages: AtomicU64,
    pub heartbeats: AtomicU64,
    pub snapshots_applied: AtomicU64,
    pub level_changes: AtomicU64,
    pub trades_applied: AtomicU64,
    pub malformed_events: AtomicU64,
    pub invalid_levels: AtomicU64,
    pub unknown_channels: AtomicU64,
    pub reconnects: AtomicU64,
    pub snapshot_retries: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_applied(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_level_change(&self) {
        self.level_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_trade_applied(&self) {
        self.trades_applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_invalid_level(&self) {
        self.invalid_levels.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_channel(&self) {
        self.unknown_channels.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_retry(&self) {
        self.snapshot_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line summary for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "messages={} heartbeats={} snapshots={} levels={} trades={} malformed={} invalid={} unknown_channel={} reconnects={} snapshot_retries={}",
            self.messages.load(Ordering::Relaxed),
            self.heartbeats.load(Ordering::Relaxed),
            self.snapshots_applied.load(Ordering::Relaxed),
            self.level_changes.load(Ordering::Relaxed),
            self.trades_applied.load(Ordering::Relaxed),
            self.malformed_events.load(Ordering::Relaxed),
            self.invalid_levels.load(Ordering::Relaxed),
            self.unknown_channels.load(Ordering::Relaxed),
            self.reconnects.load(Ordering::Relaxed),
            self.snapshot_retries.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roll_up_into_the_summary() {
        let metrics = FeedMetrics::new();
        metrics.record_message();
        metrics.record_message();
        metrics.record_heartbeat();
        metrics.record_snapshot_applied();
        metrics.record_reconnect();

        assert_eq!(metrics.messages.load(Ordering::Relaxed), 2);
        let summary = metrics.summary();
        assert!(summary.contains("messages=2"));
        assert!(summary.contains("heartbeats=1"));
        assert!(summary.contains("reconnects=1"));
    }
}
