//! In-process counters for pipeline activity. Deliberately lightweight —
//! counters only, no histograms or an exporter; a full metrics surface is
//! out of scope, but bare atomics cost nothing to carry.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for one pipeline (including its extensions, which
/// reuse the parent's handle).
#[derive(Default)]
pub struct PipelineMetrics {
    items_emitted: AtomicU64,
    tap_sends: AtomicU64,
    tap_timeouts: AtomicU64,
    tap_drops: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_item_emitted(&self) {
        self.items_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tap_send(&self) {
        self.tap_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tap_timeout(&self) {
        self.tap_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tap_drop(&self) {
        self.tap_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time snapshot, cheap to clone and log.
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            tap_sends: self.tap_sends.load(Ordering::Relaxed),
            tap_timeouts: self.tap_timeouts.load(Ordering::Relaxed),
            tap_drops: self.tap_drops.load(Ordering::Relaxed),
        }
    }
}

/// A copyable snapshot of [`PipelineMetrics`] at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PipelineMetricsSnapshot {
    pub items_emitted: u64,
    pub tap_sends: u64,
    pub tap_timeouts: u64,
    pub tap_drops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = PipelineMetrics::new();
        metrics.record_item_emitted();
        metrics.record_item_emitted();
        metrics.record_tap_send();
        metrics.record_tap_timeout();
        metrics.record_tap_drop();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_emitted, 2);
        assert_eq!(snapshot.tap_sends, 1);
        assert_eq!(snapshot.tap_timeouts, 1);
        assert_eq!(snapshot.tap_drops, 1);
    }
}
