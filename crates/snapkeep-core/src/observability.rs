//! In-process backup metrics.
//!
//! Exporter registration (Prometheus or otherwise) lives in the embedding
//! application; the engine only records into this shared struct.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Rolled-up signals for one source.
#[derive(Debug, Clone, Default)]
pub struct SourceMetrics {
    pub source_name: String,
    pub last_run: Option<DateTime<Utc>>,
    /// 1 after a successful run, 0 after a failed one.
    pub last_status: u8,
    pub last_duration: Duration,
    pub bytes_transferred_total: u64,
    /// Fraction of bytes served by dedup on the last run.
    pub dedup_ratio: f64,
    pub runs: u64,
}

#[derive(Default)]
struct MetricsInner {
    sources: HashMap<i64, SourceMetrics>,
    errors: HashMap<String, u64>,
}

/// Shared metric sink for backup runs. Cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a completed (successful) backup for a source.
    pub fn record_backup(
        &self,
        source_id: i64,
        source_name: &str,
        duration: Duration,
        delta_bytes: u64,
        total_bytes: u64,
    ) {
        let mut inner = self.lock();
        let entry = inner.sources.entry(source_id).or_default();
        entry.source_name = source_name.to_string();
        entry.last_run = Some(Utc::now());
        entry.last_status = 1;
        entry.last_duration = duration;
        entry.bytes_transferred_total += delta_bytes;
        entry.dedup_ratio = if total_bytes == 0 {
            0.0
        } else {
            (total_bytes - delta_bytes) as f64 / total_bytes as f64
        };
        entry.runs += 1;
    }

    /// Record a failed backup for a source.
    pub fn record_backup_failure(&self, source_id: i64, source_name: &str) {
        let mut inner = self.lock();
        let entry = inner.sources.entry(source_id).or_default();
        entry.source_name = source_name.to_string();
        entry.last_status = 0;
        entry.runs += 1;
    }

    /// Increment the error counter for an operation label.
    pub fn record_error(&self, operation: &str) {
        let mut inner = self.lock();
        *inner.errors.entry(operation.to_string()).or_insert(0) += 1;
    }

    pub fn error_count(&self, operation: &str) -> u64 {
        self.lock().errors.get(operation).copied().unwrap_or(0)
    }

    pub fn source(&self, source_id: i64) -> Option<SourceMetrics> {
        self.lock().sources.get(&source_id).cloned()
    }
}
