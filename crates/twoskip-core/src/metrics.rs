//! Lightweight operational counters for a database handle.
//!
//! Thread-safe atomic counters in the shape of the corpus's operational
//! metrics (simple `AtomicU64` fields plus a Prometheus text exporter)
//! rather than a full histogram library — twoskip only needs enough to
//! answer "how much work did recovery/checkpoint just do", which
//! the informational log line emitted after recovery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-handle counters. Cheap to read/update from any thread; the engine
/// itself is single-writer, but metrics may be polled concurrently.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub fetches: AtomicU64,
    pub stores: AtomicU64,
    pub deletes: AtomicU64,
    pub commits: AtomicU64,
    pub aborts: AtomicU64,
    pub recoveries_run: AtomicU64,
    pub records_scanned: AtomicU64,
    pub pointers_fixed: AtomicU64,
    pub checkpoints_run: AtomicU64,
    checkpoint_nanos_total: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one recovery pass: how many records it walked and how many
    /// stale pointers it had to rewrite.
    pub fn record_recovery(&self, records_scanned: u64, pointers_fixed: u64) {
        self.recoveries_run.fetch_add(1, Ordering::Relaxed);
        self.records_scanned
            .fetch_add(records_scanned, Ordering::Relaxed);
        self.pointers_fixed
            .fetch_add(pointers_fixed, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self, elapsed: Duration) {
        self.checkpoints_run.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_nanos_total
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Renders counters as Prometheus exposition text, in the style of the
    /// corpus's `OperationalMetrics::export_prometheus`.
    pub fn export_prometheus(&self, db_name: &str) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "# HELP twoskip_fetches_total Fetch operations");
        let _ = writeln!(out, "# TYPE twoskip_fetches_total counter");
        let _ = writeln!(
            out,
            "twoskip_fetches_total{{db=\"{db_name}\"}} {}",
            self.fetches.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# HELP twoskip_recoveries_total Recovery passes run");
        let _ = writeln!(out, "# TYPE twoskip_recoveries_total counter");
        let _ = writeln!(
            out,
            "twoskip_recoveries_total{{db=\"{db_name}\"}} {}",
            self.recoveries_run.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# HELP twoskip_checkpoints_total Checkpoints run");
        let _ = writeln!(out, "# TYPE twoskip_checkpoints_total counter");
        let _ = writeln!(
            out,
            "twoskip_checkpoints_total{{db=\"{db_name}\"}} {}",
            self.checkpoints_run.load(Ordering::Relaxed)
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = EngineMetrics::new();
        m.record_fetch();
        m.record_fetch();
        m.record_recovery(10, 3);
        m.record_checkpoint(Duration::from_millis(5));
        assert_eq!(m.fetches.load(Ordering::Relaxed), 2);
        assert_eq!(m.records_scanned.load(Ordering::Relaxed), 10);
        assert_eq!(m.pointers_fixed.load(Ordering::Relaxed), 3);
        assert_eq!(m.checkpoints_run.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn prometheus_export_contains_counters() {
        let m = EngineMetrics::new();
        m.record_fetch();
        let out = m.export_prometheus("test.db");
        assert!(out.contains("twoskip_fetches_total"));
        assert!(out.contains("db=\"test.db\""));
    }
}
