use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// Dialog gauges (active, early) and counters (processed, expired, failed).
#[derive(Debug, Clone, Default)]
pub struct DialogMetrics {
    inner: Arc<RwLock<MetricsData>>,
}

#[derive(Debug, Default)]
struct MetricsData {
    active: u64,
    early: u64,
    processed: u64,
    expired: u64,
    failed: u64,
    last_updated: Option<Instant>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialogMetricsSnapshot {
    pub active: u64,
    pub early: u64,
    pub processed: u64,
    pub expired: u64,
    pub failed: u64,
    pub last_updated: Option<Instant>,
}

impl DialogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dialog was created and linked
    pub fn record_processed(&self) {
        let mut data = self.inner.write();
        data.processed += 1;
        data.last_updated = Some(Instant::now());
    }

    pub fn record_early(&self) {
        let mut data = self.inner.write();
        data.early += 1;
        data.last_updated = Some(Instant::now());
    }

    /// The dialog was answered; `from_early` lowers the early gauge
    pub fn record_answered(&self, from_early: bool) {
        let mut data = self.inner.write();
        if from_early {
            data.early = data.early.saturating_sub(1);
        }
        data.active += 1;
        data.last_updated = Some(Instant::now());
    }

    /// The dialog failed before answer
    pub fn record_failed(&self, from_early: bool) {
        let mut data = self.inner.write();
        if from_early {
            data.early = data.early.saturating_sub(1);
        }
        data.failed += 1;
        data.last_updated = Some(Instant::now());
    }

    /// An answered dialog was torn down by BYE or administratively
    pub fn record_terminated(&self) {
        let mut data = self.inner.write();
        data.active = data.active.saturating_sub(1);
        data.last_updated = Some(Instant::now());
    }

    /// An answered dialog timed out
    pub fn record_expired(&self) {
        let mut data = self.inner.write();
        data.active = data.active.saturating_sub(1);
        data.expired += 1;
        data.last_updated = Some(Instant::now());
    }

    pub fn snapshot(&self) -> DialogMetricsSnapshot {
        let data = self.inner.read();
        DialogMetricsSnapshot {
            active: data.active,
            early: data.early,
            processed: data.processed,
            expired: data.expired,
            failed: data.failed,
            last_updated: data.last_updated,
        }
    }
}
